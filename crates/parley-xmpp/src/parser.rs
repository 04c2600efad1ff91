//! Incremental XML stream decoder.
//!
//! Wraps a namespace-aware pull tokenizer over an async byte source and turns
//! one XMPP stream into a sequence of [`Packet`]s. The stream header is
//! special-cased; every other top-level element is read as a whole subtree
//! and materialized through the [`ElementRegistry`].

use std::fmt;
use std::sync::Arc;

use minidom::Element;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::NsReader;
use tokio::io::AsyncBufRead;
use tracing::trace;

use crate::packet::Packet;
use crate::registry::ElementRegistry;
use crate::types::StreamVersion;
use crate::{DecodeError, XmppError};

/// XMPP namespaces.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const JABBER_SERVER: &str = "jabber:server";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    pub const PING: &str = "urn:xmpp:ping";
}

/// A namespace-qualified element name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    pub ns: String,
    pub local: String,
}

impl QName {
    pub fn new(ns: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            local: local.into(),
        }
    }

    /// The qualified name of a parsed element.
    pub fn of(element: &Element) -> Self {
        Self::new(element.ns(), element.name())
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.ns, self.local)
    }
}

/// Attributes of a `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    /// Default namespace declared on the header (`jabber:client`, `jabber:server`)
    pub default_ns: Option<String>,
    /// Namespace the header's own name resolved to
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// Header we send for a stream in `content_ns`.
    pub fn outbound(content_ns: &str) -> Self {
        Self {
            default_ns: Some(content_ns.to_string()),
            stream_ns: Some(ns::STREAM.to_string()),
            ..Self::default()
        }
    }

    /// The requested version. A header without one speaks the pre-1.0 protocol.
    pub fn version(&self) -> Result<StreamVersion, XmppError> {
        match self.version.as_deref() {
            None => Ok(StreamVersion::LEGACY),
            Some(raw) => raw.parse(),
        }
    }

    /// Serialize as an unclosed opening tag.
    pub fn to_xml(&self) -> String {
        let mut header = String::from("<stream:stream");
        if let Some(default_ns) = &self.default_ns {
            push_attr(&mut header, "xmlns", default_ns);
        }
        push_attr(
            &mut header,
            "xmlns:stream",
            self.stream_ns.as_deref().unwrap_or(ns::STREAM),
        );
        for (name, value) in [
            ("id", &self.id),
            ("from", &self.from),
            ("to", &self.to),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ] {
            if let Some(value) = value {
                push_attr(&mut header, name, value);
            }
        }
        header.push('>');
        header
    }
}

pub(crate) fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("='");
    out.push_str(&quick_xml::escape::escape(value));
    out.push('\'');
}

/// Pull decoder for one stream.
///
/// The sequence ends with `Ok(None)` at end of input or after the stream's
/// closing tag. Any error poisons the decoder; a restarted stream needs a
/// fresh decoder over the same reader (see [`Decoder::into_inner`]).
pub struct Decoder<R> {
    reader: NsReader<R>,
    buf: Vec<u8>,
    registry: Arc<ElementRegistry>,
    opened: bool,
    pending_close: bool,
    finished: bool,
    poisoned: bool,
}

impl<R: AsyncBufRead + Unpin> Decoder<R> {
    pub fn new(inner: R, registry: Arc<ElementRegistry>) -> Self {
        let mut reader = NsReader::from_reader(inner);
        // A restarted stream may be closed before its new header arrives.
        reader.config_mut().allow_unmatched_ends = true;
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            registry,
            opened: false,
            pending_close: false,
            finished: false,
            poisoned: false,
        }
    }

    /// Whether the stream header has been read.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Give back the byte source, including anything buffered but not yet decoded.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Decode the next top-level element.
    pub async fn next(&mut self) -> Result<Option<Packet>, DecodeError> {
        if self.poisoned {
            return Err(DecodeError::Poisoned);
        }
        if self.finished {
            return Ok(None);
        }
        if self.pending_close {
            self.finished = true;
            return Ok(Some(Packet::StreamClose));
        }

        match self.read_packet().await {
            Ok(Some(packet)) => {
                if matches!(packet, Packet::StreamClose) {
                    self.finished = true;
                }
                trace!(element = %packet.qname(), "decoded element");
                Ok(Some(packet))
            }
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        loop {
            match self.next_token().await? {
                Token::Eof => return Ok(None),
                Token::Decl if !self.opened => continue,
                Token::Decl => return Err(DecodeError::RestrictedXml("XML declaration inside the stream")),
                Token::Restricted(what) => return Err(DecodeError::RestrictedXml(what)),
                Token::Text(text) if text.trim().is_empty() => continue,
                Token::Text(text) => return Err(DecodeError::BadFormat(text)),
                Token::Open(tag) if tag.is_stream() => {
                    self.opened = true;
                    return Ok(Some(Packet::StreamOpen(tag.into_header())));
                }
                Token::Empty(tag) if tag.is_stream() => {
                    self.opened = true;
                    self.pending_close = true;
                    return Ok(Some(Packet::StreamOpen(tag.into_header())));
                }
                Token::Open(tag) => {
                    let (element, lang) = self.read_subtree(tag).await?;
                    return Ok(Some(self.materialize(element, lang)));
                }
                Token::Empty(tag) => {
                    let lang = tag.lang.clone();
                    let element = tag.into_element()?;
                    return Ok(Some(self.materialize(element, lang)));
                }
                Token::Close { is_stream: true, .. } => return Ok(Some(Packet::StreamClose)),
                Token::Close { name, .. } => return Err(DecodeError::UnexpectedEndOfElement(name)),
            }
        }
    }

    /// Read the rest of an element whose start tag was just consumed.
    async fn read_subtree(&mut self, root: Tag) -> Result<(Element, Option<String>), DecodeError> {
        let lang = root.lang.clone();
        let mut stack = vec![root.into_element()?];

        loop {
            match self.next_token().await? {
                Token::Open(tag) => stack.push(tag.into_element()?),
                Token::Empty(tag) => {
                    let child = tag.into_element()?;
                    if let Some(parent) = stack.last_mut() {
                        parent.append_child(child);
                    }
                }
                Token::Close { name, .. } => {
                    let element = stack
                        .pop()
                        .ok_or(DecodeError::UnexpectedEndOfElement(name))?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.append_child(element);
                        }
                        None => return Ok((element, lang)),
                    }
                }
                Token::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.append_text_node(text);
                    }
                }
                Token::Decl => return Err(DecodeError::RestrictedXml("XML declaration inside an element")),
                Token::Restricted(what) => return Err(DecodeError::RestrictedXml(what)),
                Token::Eof => {
                    return Err(DecodeError::NotWellFormed(
                        "end of input inside an element".to_string(),
                    ))
                }
            }
        }
    }

    fn materialize(&self, element: Element, lang: Option<String>) -> Packet {
        match self.registry.lookup(&QName::of(&element)) {
            Some(shape) => Packet::from_shape(shape, element, lang),
            None => Packet::Custom(element),
        }
    }

    async fn next_token(&mut self) -> Result<Token, DecodeError> {
        self.buf.clear();
        let (resolved, event) = self
            .reader
            .read_resolved_event_into_async(&mut self.buf)
            .await?;
        let namespace = TagNamespace::from_resolved(resolved)?;

        let token = match event {
            Event::Start(start) => Token::Open(Tag::read(namespace, &start, &self.reader)?),
            Event::Empty(start) => Token::Empty(Tag::read(namespace, &start, &self.reader)?),
            Event::End(end) => Token::Close {
                name: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                is_stream: end.local_name().as_ref() == b"stream" && namespace.is_stream(),
            },
            Event::Text(text) => Token::Text(text.unescape()?.into_owned()),
            Event::CData(cdata) => Token::Text(utf8(&cdata)?),
            Event::Comment(_) => Token::Restricted("comment"),
            Event::PI(_) => Token::Restricted("processing instruction"),
            Event::DocType(_) => Token::Restricted("document type declaration"),
            Event::Decl(_) => Token::Decl,
            Event::Eof => Token::Eof,
        };
        Ok(token)
    }
}

enum Token {
    Open(Tag),
    Empty(Tag),
    Close { name: String, is_stream: bool },
    Text(String),
    Decl,
    Restricted(&'static str),
    Eof,
}

enum TagNamespace {
    Bound(String),
    Unbound,
    Unknown(String),
}

impl TagNamespace {
    fn from_resolved(resolved: ResolveResult<'_>) -> Result<Self, DecodeError> {
        Ok(match resolved {
            ResolveResult::Bound(ns) => Self::Bound(utf8(ns.0)?),
            ResolveResult::Unbound => Self::Unbound,
            ResolveResult::Unknown(prefix) => Self::Unknown(utf8(&prefix)?),
        })
    }

    fn is_stream(&self) -> bool {
        match self {
            Self::Bound(ns) => ns == ns::STREAM,
            Self::Unknown(prefix) => prefix == "stream",
            Self::Unbound => false,
        }
    }
}

/// An owned start tag, detached from the tokenizer's buffer.
struct Tag {
    ns: TagNamespace,
    local: String,
    /// Every attribute except namespace declarations, under its qualified name
    attrs: Vec<(String, String)>,
    /// Bindings for the prefixes `attrs` use, resolved at this tag
    prefixes: Vec<(String, String)>,
    lang: Option<String>,
    default_ns: Option<String>,
}

impl Tag {
    fn read<R>(
        ns: TagNamespace,
        start: &BytesStart<'_>,
        reader: &NsReader<R>,
    ) -> Result<Self, DecodeError> {
        let mut tag = Tag {
            ns,
            local: utf8(start.local_name().as_ref())?,
            attrs: Vec::new(),
            prefixes: Vec::new(),
            lang: None,
            default_ns: None,
        };

        for attr in start.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?.into_owned();
            match attr.key.as_namespace_binding() {
                Some(PrefixDeclaration::Default) => tag.default_ns = Some(value),
                // Prefix bindings are tracked by the reader.
                Some(PrefixDeclaration::Named(_)) => {}
                None => {
                    let key = utf8(attr.key.as_ref())?;
                    if key == "xml:lang" {
                        tag.lang = Some(value.clone());
                    }
                    if let Some(prefix) = attr.key.prefix() {
                        let (resolved, _) = reader.resolve_attribute(attr.key);
                        tag.bind_prefix(utf8(prefix.as_ref())?, resolved)?;
                    }
                    tag.attrs.push((key, value));
                }
            }
        }

        Ok(tag)
    }

    fn bind_prefix(
        &mut self,
        prefix: String,
        resolved: ResolveResult<'_>,
    ) -> Result<(), DecodeError> {
        // The xml prefix is bound by definition.
        if prefix == "xml" || self.prefixes.iter().any(|(known, _)| *known == prefix) {
            return Ok(());
        }
        match resolved {
            ResolveResult::Bound(ns) => {
                let ns = utf8(ns.0)?;
                self.prefixes.push((prefix, ns));
                Ok(())
            }
            _ => Err(DecodeError::BadNamespacePrefix(prefix)),
        }
    }

    fn is_stream(&self) -> bool {
        self.local == "stream" && self.ns.is_stream()
    }

    fn attr(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn into_header(self) -> StreamHeader {
        StreamHeader {
            to: self.attr("to"),
            from: self.attr("from"),
            id: self.attr("id"),
            version: self.attr("version"),
            lang: self.lang,
            default_ns: self.default_ns,
            stream_ns: match self.ns {
                TagNamespace::Bound(ns) => Some(ns),
                _ => None,
            },
        }
    }

    fn into_element(self) -> Result<Element, DecodeError> {
        let ns = match self.ns {
            TagNamespace::Bound(ns) => ns,
            TagNamespace::Unbound => String::new(),
            TagNamespace::Unknown(prefix) => return Err(DecodeError::BadNamespacePrefix(prefix)),
        };
        let mut builder = Element::builder(self.local.as_str(), ns);
        for (prefix, namespace) in self.prefixes {
            builder = builder
                .prefix(Some(prefix.clone()), namespace)
                .map_err(|_| DecodeError::BadNamespacePrefix(prefix))?;
        }
        for (key, value) in self.attrs {
            builder = builder.attr(key, value);
        }
        Ok(builder.build())
    }
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| DecodeError::NotWellFormed(e.to_string()))
}
