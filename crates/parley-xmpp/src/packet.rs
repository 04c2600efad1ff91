//! Typed protocol elements.
//!
//! [`Packet`] is the closed set of top-level elements the engine understands,
//! plus [`Packet::Custom`] for everything else. Packets are produced by the
//! decoder and serialized back with [`Packet::to_xml`].

use base64::prelude::*;
use minidom::Element;

use crate::error::{SaslCondition, StanzaErrorCondition, StanzaErrorType, StreamErrorCondition};
use crate::parser::{ns, push_attr, QName, StreamHeader};
use crate::registry::Shape;
use crate::types::IqType;

/// A decoded top-level stream element.
#[derive(Debug, Clone)]
pub enum Packet {
    StreamOpen(StreamHeader),
    StreamClose,
    Features(StreamFeatures),
    StartTls,
    TlsProceed,
    TlsFailure,
    TlsAbort,
    SaslAuth(SaslAuth),
    SaslChallenge(SaslPayload),
    SaslResponse(SaslPayload),
    SaslSuccess(SaslPayload),
    SaslFailure(SaslFailure),
    SaslAbort,
    Iq(Stanza),
    Message(Stanza),
    Presence(Stanza),
    StreamError(StreamError),
    Compress(Compress),
    Compressed,
    CompressFailure(String),
    /// An element the registry has no shape for, kept verbatim
    Custom(Element),
}

impl Packet {
    /// Decode `element` into the typed shape the registry mapped it to.
    pub fn from_shape(shape: Shape, element: Element, lang: Option<String>) -> Self {
        match shape {
            Shape::Features => Self::Features(StreamFeatures::from_element(&element)),
            Shape::StreamError => Self::StreamError(StreamError::from_element(&element)),
            Shape::StartTls => Self::StartTls,
            Shape::TlsProceed => Self::TlsProceed,
            Shape::TlsFailure => Self::TlsFailure,
            Shape::TlsAbort => Self::TlsAbort,
            Shape::SaslAuth => Self::SaslAuth(SaslAuth {
                mechanism: element.attr("mechanism").unwrap_or_default().to_string(),
                payload: SaslPayload::from_element(&element),
            }),
            Shape::SaslChallenge => Self::SaslChallenge(SaslPayload::from_element(&element)),
            Shape::SaslResponse => Self::SaslResponse(SaslPayload::from_element(&element)),
            Shape::SaslSuccess => Self::SaslSuccess(SaslPayload::from_element(&element)),
            Shape::SaslFailure => Self::SaslFailure(SaslFailure::from_element(&element)),
            Shape::SaslAbort => Self::SaslAbort,
            Shape::Iq => Self::Iq(Stanza::from_element(&element, lang)),
            Shape::Message => Self::Message(Stanza::from_element(&element, lang)),
            Shape::Presence => Self::Presence(Stanza::from_element(&element, lang)),
            Shape::Compress => Self::Compress(Compress {
                method: element
                    .get_child("method", ns::COMPRESS)
                    .map(|method| method.text().trim().to_string()),
            }),
            Shape::Compressed => Self::Compressed,
            Shape::CompressFailure => Self::CompressFailure(
                element
                    .children()
                    .next()
                    .map(|condition| condition.name().to_string())
                    .unwrap_or_else(|| "setup-failed".to_string()),
            ),
        }
    }

    /// The qualified name this packet is serialized under.
    pub fn qname(&self) -> QName {
        let (namespace, local) = match self {
            Self::StreamOpen(_) | Self::StreamClose => (ns::STREAM, "stream"),
            Self::Features(_) => (ns::STREAM, "features"),
            Self::StreamError(_) => (ns::STREAM, "error"),
            Self::StartTls => (ns::TLS, "starttls"),
            Self::TlsProceed => (ns::TLS, "proceed"),
            Self::TlsFailure => (ns::TLS, "failure"),
            Self::TlsAbort => (ns::TLS, "abort"),
            Self::SaslAuth(_) => (ns::SASL, "auth"),
            Self::SaslChallenge(_) => (ns::SASL, "challenge"),
            Self::SaslResponse(_) => (ns::SASL, "response"),
            Self::SaslSuccess(_) => (ns::SASL, "success"),
            Self::SaslFailure(_) => (ns::SASL, "failure"),
            Self::SaslAbort => (ns::SASL, "abort"),
            Self::Iq(stanza) => return QName::new(stanza.ns.as_str(), "iq"),
            Self::Message(stanza) => return QName::new(stanza.ns.as_str(), "message"),
            Self::Presence(stanza) => return QName::new(stanza.ns.as_str(), "presence"),
            Self::Compress(_) => (ns::COMPRESS, "compress"),
            Self::Compressed => (ns::COMPRESS, "compressed"),
            Self::CompressFailure(_) => (ns::COMPRESS, "failure"),
            Self::Custom(element) => return QName::of(element),
        };
        QName::new(namespace, local)
    }

    /// Serialize for the wire.
    pub fn to_xml(&self) -> String {
        match self {
            Self::StreamOpen(header) => header.to_xml(),
            Self::StreamClose => "</stream:stream>".to_string(),
            Self::Features(features) => features.to_xml(),
            Self::StartTls => format!("<starttls xmlns='{}'/>", ns::TLS),
            Self::TlsProceed => format!("<proceed xmlns='{}'/>", ns::TLS),
            Self::TlsFailure => format!("<failure xmlns='{}'/>", ns::TLS),
            Self::TlsAbort => format!("<abort xmlns='{}'/>", ns::TLS),
            Self::SaslAuth(auth) => {
                let mut open = format!("<auth xmlns='{}'", ns::SASL);
                push_attr(&mut open, "mechanism", &auth.mechanism);
                auth.payload.wrap_open(&open, "auth")
            }
            Self::SaslChallenge(payload) => payload.wrap("challenge"),
            Self::SaslResponse(payload) => payload.wrap("response"),
            Self::SaslSuccess(payload) => payload.wrap("success"),
            Self::SaslFailure(failure) => failure.to_xml(),
            Self::SaslAbort => format!("<abort xmlns='{}'/>", ns::SASL),
            Self::Iq(stanza) => stanza.to_xml("iq"),
            Self::Message(stanza) => stanza.to_xml("message"),
            Self::Presence(stanza) => stanza.to_xml("presence"),
            Self::StreamError(error) => error.to_xml(),
            Self::Compress(compress) => match &compress.method {
                Some(method) => format!(
                    "<compress xmlns='{}'><method>{}</method></compress>",
                    ns::COMPRESS,
                    quick_xml::escape::escape(method)
                ),
                None => format!("<compress xmlns='{}'/>", ns::COMPRESS),
            },
            Self::Compressed => format!("<compressed xmlns='{}'/>", ns::COMPRESS),
            Self::CompressFailure(condition) => {
                format!("<failure xmlns='{}'><{}/></failure>", ns::COMPRESS, condition)
            }
            Self::Custom(element) => String::from(element),
        }
    }

    /// SASL `<failure/>` with `condition`.
    pub fn sasl_failure(condition: SaslCondition) -> Self {
        Self::SaslFailure(SaslFailure {
            condition: Some(condition),
            text: None,
        })
    }

    /// Stream-level `<stream:error/>`.
    pub fn stream_error(condition: StreamErrorCondition, text: Option<String>) -> Self {
        Self::StreamError(StreamError { condition, text })
    }
}

/// `<stream:features/>` contents.
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    /// STARTTLS offered; the flag says whether it is required
    pub starttls: Option<bool>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// Legacy session establishment offered (always optional)
    pub session: bool,
    pub compression: Vec<String>,
    /// Features this engine does not interpret
    pub other: Vec<Element>,
}

impl StreamFeatures {
    fn from_element(element: &Element) -> Self {
        let mut features = Self::default();
        for child in element.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = Some(child.get_child("required", ns::TLS).is_some());
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|m| m.is("mechanism", ns::SASL))
                    .map(|m| m.text().trim().to_string())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("session", ns::SESSION) {
                features.session = true;
            } else if child.is("compression", ns::COMPRESS_FEATURE) {
                features.compression = child
                    .children()
                    .filter(|m| m.is("method", ns::COMPRESS_FEATURE))
                    .map(|m| m.text().trim().to_string())
                    .collect();
            } else {
                features.other.push(child.clone());
            }
        }
        features
    }

    fn to_xml(&self) -> String {
        let mut xml = String::from("<stream:features>");
        if let Some(required) = self.starttls {
            if required {
                xml.push_str(&format!("<starttls xmlns='{}'><required/></starttls>", ns::TLS));
            } else {
                xml.push_str(&format!("<starttls xmlns='{}'/>", ns::TLS));
            }
        }
        if !self.mechanisms.is_empty() {
            xml.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for mechanism in &self.mechanisms {
                xml.push_str(&format!(
                    "<mechanism>{}</mechanism>",
                    quick_xml::escape::escape(mechanism)
                ));
            }
            xml.push_str("</mechanisms>");
        }
        if !self.compression.is_empty() {
            xml.push_str(&format!("<compression xmlns='{}'>", ns::COMPRESS_FEATURE));
            for method in &self.compression {
                xml.push_str(&format!("<method>{}</method>", quick_xml::escape::escape(method)));
            }
            xml.push_str("</compression>");
        }
        if self.bind {
            xml.push_str(&format!("<bind xmlns='{}'/>", ns::BIND));
        }
        if self.session {
            xml.push_str(&format!("<session xmlns='{}'><optional/></session>", ns::SESSION));
        }
        for other in &self.other {
            xml.push_str(&String::from(other));
        }
        xml.push_str("</stream:features>");
        xml
    }
}

/// `<auth mechanism='...'>` request.
#[derive(Debug, Clone)]
pub struct SaslAuth {
    pub mechanism: String,
    pub payload: SaslPayload,
}

/// Base64 character data of a SASL element, as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslPayload {
    pub data: Option<String>,
}

impl SaslPayload {
    /// Encode `bytes`; an empty message is sent as `=`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            Self {
                data: Some("=".to_string()),
            }
        } else {
            Self {
                data: Some(BASE64_STANDARD.encode(bytes)),
            }
        }
    }

    /// Decode the payload. Absent data, `=` and an empty body all mean no bytes.
    pub fn decode(&self) -> Result<Vec<u8>, SaslCondition> {
        let raw: String = self
            .data
            .as_deref()
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        if raw.is_empty() || raw == "=" {
            return Ok(Vec::new());
        }
        BASE64_STANDARD
            .decode(raw)
            .map_err(|_| SaslCondition::IncorrectEncoding)
    }

    fn from_element(element: &Element) -> Self {
        let text = element.text();
        let trimmed = text.trim();
        Self {
            data: (!trimmed.is_empty()).then(|| trimmed.to_string()),
        }
    }

    fn wrap(&self, local: &str) -> String {
        self.wrap_open(&format!("<{} xmlns='{}'", local, ns::SASL), local)
    }

    fn wrap_open(&self, open: &str, local: &str) -> String {
        match &self.data {
            Some(data) => format!("{open}>{}</{local}>", quick_xml::escape::escape(data)),
            None => format!("{open}/>"),
        }
    }
}

/// SASL `<failure/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslFailure {
    /// `None` when the peer sent a condition this engine does not know
    pub condition: Option<SaslCondition>,
    pub text: Option<String>,
}

impl SaslFailure {
    fn from_element(element: &Element) -> Self {
        let mut failure = Self::default();
        for child in element.children() {
            if child.name() == "text" {
                failure.text = Some(child.text());
            } else if failure.condition.is_none() {
                failure.condition = child.name().parse().ok();
            }
        }
        failure
    }

    fn to_xml(&self) -> String {
        let mut xml = format!("<failure xmlns='{}'>", ns::SASL);
        if let Some(condition) = self.condition {
            xml.push_str(&format!("<{}/>", condition.as_str()));
        }
        if let Some(text) = &self.text {
            xml.push_str(&format!("<text>{}</text>", quick_xml::escape::escape(text)));
        }
        xml.push_str("</failure>");
        xml
    }
}

/// `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
}

impl StreamError {
    fn from_element(element: &Element) -> Self {
        let mut condition = StreamErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in element.children().filter(|c| c.ns() == ns::STREAMS) {
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Ok(parsed) = child.name().parse() {
                condition = parsed;
            }
        }
        Self { condition, text }
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            "<stream:error><{} xmlns='{}'/>",
            self.condition.as_str(),
            ns::STREAMS
        );
        if let Some(text) = &self.text {
            xml.push_str(&format!(
                "<text xmlns='{}' xml:lang='en'>{}</text>",
                ns::STREAMS,
                quick_xml::escape::escape(text)
            ));
        }
        xml.push_str("</stream:error>");
        xml
    }
}

/// XEP-0138 `<compress/>` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compress {
    pub method: Option<String>,
}

/// An `<iq/>`, `<message/>` or `<presence/>`.
#[derive(Debug, Clone)]
pub struct Stanza {
    /// `jabber:client` or `jabber:server`
    pub ns: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub stanza_type: Option<String>,
    pub lang: Option<String>,
    pub payload: Vec<Element>,
}

impl Stanza {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            ns: namespace.into(),
            from: None,
            to: None,
            id: None,
            stanza_type: None,
            lang: None,
            payload: Vec::new(),
        }
    }

    fn from_element(element: &Element, lang: Option<String>) -> Self {
        Self {
            ns: element.ns(),
            from: element.attr("from").map(str::to_string),
            to: element.attr("to").map(str::to_string),
            id: element.attr("id").map(str::to_string),
            stanza_type: element.attr("type").map(str::to_string),
            lang,
            payload: element.children().cloned().collect(),
        }
    }

    pub fn with_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.stanza_type = Some(stanza_type.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_payload(mut self, element: Element) -> Self {
        self.payload.push(element);
        self
    }

    /// Parsed `type` of an IQ.
    pub fn iq_type(&self) -> Option<IqType> {
        self.stanza_type.as_deref().and_then(|t| t.parse().ok())
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type.as_deref() == Some("error")
    }

    /// First payload child with the given name.
    pub fn payload_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payload.iter().find(|child| child.is(name, namespace))
    }

    /// An IQ result answering this request.
    pub fn result_reply(&self, payload: Option<Element>) -> Stanza {
        Stanza {
            ns: self.ns.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            id: self.id.clone(),
            stanza_type: Some(IqType::Result.as_str().to_string()),
            lang: None,
            payload: payload.into_iter().collect(),
        }
    }

    /// An error reply mirroring this stanza's addressing and id.
    pub fn error_reply(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Stanza {
        let mut error = Element::builder("error", self.ns.as_str())
            .attr("type", error_type.as_str())
            .append(Element::builder(condition.as_str(), ns::STANZAS).build());
        if let Some(text) = text {
            error = error.append(
                Element::builder("text", ns::STANZAS)
                    .append(minidom::Node::Text(text.to_string()))
                    .build(),
            );
        }

        Stanza {
            ns: self.ns.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            id: self.id.clone(),
            stanza_type: Some("error".to_string()),
            lang: None,
            payload: vec![error.build()],
        }
    }

    fn to_xml(&self, local: &str) -> String {
        let mut xml = format!("<{local}");
        push_attr(&mut xml, "xmlns", &self.ns);
        for (name, value) in [
            ("from", &self.from),
            ("to", &self.to),
            ("id", &self.id),
            ("type", &self.stanza_type),
            ("xml:lang", &self.lang),
        ] {
            if let Some(value) = value {
                push_attr(&mut xml, name, value);
            }
        }
        if self.payload.is_empty() {
            xml.push_str("/>");
            return xml;
        }
        xml.push('>');
        for child in &self.payload {
            xml.push_str(&String::from(child));
        }
        xml.push_str(&format!("</{local}>"));
        xml
    }
}
