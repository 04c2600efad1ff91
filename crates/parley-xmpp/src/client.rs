//! Client side of stream negotiation.
//!
//! [`ClientStream::connect`] drives a fresh transport through the header
//! exchange, STARTTLS when offered, SASL, the post-authentication restart and
//! resource binding. The result is a bound stream that sends and receives
//! [`Packet`]s.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use jid::FullJid;
use minidom::Element;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

use crate::auth::{Credentials, MechanismRegistry};
use crate::packet::{Packet, SaslPayload, Stanza, StreamFeatures};
use crate::parser::{ns, Decoder, StreamHeader};
use crate::registry::ElementRegistry;
use crate::stream::{spawn_writer, BoxedIo, Outbound};
use crate::tls::SecureChannel;
use crate::types::{IqType, StreamVersion, TlsPolicy};
use crate::XmppError;

const BIND_ID: &str = "bind-1";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a client connects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server domain, used as `to` of our headers
    pub domain: String,
    pub credentials: Credentials,
    /// Resource to request; the server picks one when `None`
    pub resource: Option<String>,
    pub tls: TlsPolicy,
    /// Mechanisms to try in order; empty means every registered one
    pub mechanisms: Vec<String>,
    pub lang: String,
}

impl ClientConfig {
    pub fn new(domain: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            domain: domain.into(),
            credentials,
            resource: None,
            tls: TlsPolicy::Required,
            mechanisms: Vec::new(),
            lang: "en".to_string(),
        }
    }
}

type ClientReader = BufReader<ReadHalf<BoxedIo>>;

/// Reader, writer task and output queue of one transport.
struct Link {
    decoder: Decoder<ClientReader>,
    outbound: Outbound,
    writer: JoinHandle<io::Result<WriteHalf<BoxedIo>>>,
    elements: Arc<ElementRegistry>,
}

impl Link {
    fn attach(io: BoxedIo, elements: Arc<ElementRegistry>) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, writer) = spawn_writer(write_half);
        Self {
            decoder: Decoder::new(BufReader::new(read_half), Arc::clone(&elements)),
            outbound,
            writer,
            elements,
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), XmppError> {
        trace!(element = %packet.qname(), "Sending");
        self.outbound.send(packet)
    }

    /// Next packet. Stream errors and end of stream become errors.
    async fn expect(&mut self) -> Result<Packet, XmppError> {
        match self.decoder.next().await? {
            Some(Packet::StreamError(error)) => Err(XmppError::stream(error.condition, error.text)),
            Some(packet) => Ok(packet),
            None => Err(XmppError::SessionClosed),
        }
    }

    /// Send our header and read the server's header and features.
    async fn open(&mut self, config: &ClientConfig) -> Result<(Option<String>, StreamFeatures), XmppError> {
        let mut header = StreamHeader::outbound(ns::JABBER_CLIENT);
        header.to = Some(config.domain.clone());
        header.version = Some(StreamVersion::V1_0.to_string());
        header.lang = Some(config.lang.clone());
        self.outbound
            .send_raw(format!("<?xml version='1.0'?>{}", header.to_xml()))?;

        let stream_id = match self.expect().await? {
            Packet::StreamOpen(reply) => {
                if reply.version()? < StreamVersion::V1_0 {
                    return Err(XmppError::protocol("server does not speak stream version 1.0"));
                }
                reply.id
            }
            other => return Err(unexpected(&other)),
        };

        match self.expect().await? {
            Packet::Features(features) => Ok((stream_id, features)),
            other => Err(unexpected(&other)),
        }
    }

    /// Expect a new stream from the server on the same transport.
    fn restart(self) -> Self {
        let Self {
            decoder,
            outbound,
            writer,
            elements,
        } = self;
        Self {
            decoder: Decoder::new(decoder.into_inner(), Arc::clone(&elements)),
            outbound,
            writer,
            elements,
        }
    }

    /// Reassemble the transport and hand it to `channel`.
    async fn upgrade(self, channel: &dyn SecureChannel) -> Result<Self, XmppError> {
        let Self {
            decoder,
            mut outbound,
            writer,
            elements,
        } = self;
        outbound.close();
        let write_half = writer
            .await
            .map_err(|e| XmppError::internal(format!("writer task failed: {e}")))??;
        let read_half = decoder.into_inner().into_inner();

        let io = channel.upgrade(read_half.unsplit(write_half)).await?;
        Ok(Self::attach(io, elements))
    }

    async fn shutdown(mut self) {
        self.outbound.close();
        if let Ok(Ok(mut write_half)) = self.writer.await {
            let _ = write_half.shutdown().await;
        }
    }
}

fn unexpected(packet: &Packet) -> XmppError {
    XmppError::protocol(format!("unexpected {}", packet.qname()))
}

fn decode(payload: &SaslPayload) -> Result<Vec<u8>, XmppError> {
    payload.decode().map_err(|condition| XmppError::Sasl {
        condition,
        text: Some("server sent invalid base64".to_string()),
    })
}

/// First preferred mechanism that the server offers and we can run.
fn choose_mechanism(
    preferred: &[String],
    registry: &MechanismRegistry,
    offered: &[String],
) -> Option<String> {
    let registered = registry.client_mechanisms();
    let preferred = if preferred.is_empty() {
        &registered
    } else {
        preferred
    };
    preferred
        .iter()
        .find(|name| {
            offered.iter().any(|o| o.eq_ignore_ascii_case(name))
                && registered.iter().any(|r| r.eq_ignore_ascii_case(name))
        })
        .cloned()
}

/// A negotiated and bound client stream.
pub struct ClientStream {
    link: Link,
    jid: FullJid,
    stream_id: Option<String>,
    secure: bool,
}

impl ClientStream {
    /// Negotiate a stream over `io` and bind a resource.
    #[instrument(name = "xmpp.client.connect", skip_all, fields(domain = %config.domain))]
    pub async fn connect(
        io: BoxedIo,
        config: ClientConfig,
        mechanisms: Arc<MechanismRegistry>,
        secure_channel: Option<Arc<dyn SecureChannel>>,
    ) -> Result<Self, XmppError> {
        let mut link = Link::attach(io, Arc::new(ElementRegistry::standard()));
        let mut secure = false;

        let features = loop {
            let (_, features) = link.open(&config).await?;
            let channel = secure_channel.as_deref();
            match (features.starttls, channel) {
                (Some(_), Some(channel)) if !secure && config.tls != TlsPolicy::Disabled => {
                    link.send(&Packet::StartTls)?;
                    match link.expect().await? {
                        Packet::TlsProceed => {}
                        Packet::TlsFailure => {
                            return Err(XmppError::protocol("server refused STARTTLS"))
                        }
                        other => return Err(unexpected(&other)),
                    }
                    link = link.upgrade(channel).await?;
                    secure = true;
                    debug!("TLS established");
                }
                _ if !secure && config.tls == TlsPolicy::Required => {
                    return Err(XmppError::protocol("TLS is required but was not negotiated"));
                }
                _ => break features,
            }
        };

        let mechanism = choose_mechanism(&config.mechanisms, &mechanisms, &features.mechanisms)
            .ok_or_else(|| {
                XmppError::auth_failed(format!(
                    "no common SASL mechanism in {:?}",
                    features.mechanisms
                ))
            })?;
        let mut handler = mechanisms
            .create_client(&mechanism, &config.credentials)
            .ok_or_else(|| XmppError::internal(format!("mechanism {mechanism} vanished")))?;
        debug!(mechanism = %mechanism, "Authenticating");

        link.send(&handler.begin()?)?;
        loop {
            match link.expect().await? {
                Packet::SaslChallenge(payload) => {
                    let reply = handler.challenge(&decode(&payload)?)?;
                    link.send(&reply)?;
                }
                Packet::SaslSuccess(payload) => {
                    handler.success(&decode(&payload)?)?;
                    break;
                }
                Packet::SaslFailure(failure) => {
                    handler.failure(&failure)?;
                    return Err(XmppError::auth_failed("server rejected authentication"));
                }
                other => return Err(unexpected(&other)),
            }
        }

        let mut link = link.restart();
        let (stream_id, features) = link.open(&config).await?;
        if !features.bind {
            return Err(XmppError::protocol("server does not offer resource binding"));
        }

        let jid = bind(&mut link, config.resource.as_deref()).await?;
        info!(jid = %jid, secure, "Client stream ready");

        Ok(Self {
            link,
            jid,
            stream_id,
            secure,
        })
    }

    /// The bound full JID.
    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn send(&mut self, packet: &Packet) -> Result<(), XmppError> {
        self.link.send(packet)
    }

    /// Next packet from the server; `None` once the server closed its stream.
    pub async fn next(&mut self) -> Result<Option<Packet>, XmppError> {
        Ok(self.link.decoder.next().await?)
    }

    /// Close our stream and wait briefly for the server to close its own.
    pub async fn close(mut self) -> Result<(), XmppError> {
        self.link.outbound.send_closing_tag()?;
        let drained = tokio::time::timeout(CLOSE_TIMEOUT, async {
            while let Some(packet) = self.link.decoder.next().await? {
                trace!(element = %packet.qname(), "Discarding packet after close");
            }
            Ok::<_, XmppError>(())
        })
        .await;
        self.link.shutdown().await;
        match drained {
            Ok(result) => result,
            Err(_) => Err(XmppError::protocol("server did not close its stream")),
        }
    }
}

async fn bind(link: &mut Link, resource: Option<&str>) -> Result<FullJid, XmppError> {
    let mut request = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        request = request.append(
            Element::builder("resource", ns::BIND)
                .append(minidom::Node::Text(resource.to_string()))
                .build(),
        );
    }
    let iq = Stanza::new(ns::JABBER_CLIENT)
        .with_type(IqType::Set.as_str())
        .with_id(BIND_ID)
        .with_payload(request.build());
    link.send(&Packet::Iq(iq))?;

    loop {
        let packet = link.expect().await?;
        let Packet::Iq(reply) = &packet else {
            return Err(unexpected(&packet));
        };
        if reply.id.as_deref() != Some(BIND_ID) {
            trace!(id = ?reply.id, "Skipping unrelated IQ during bind");
            continue;
        }
        if reply.iq_type() != Some(IqType::Result) {
            return Err(XmppError::protocol("resource binding was refused"));
        }
        let text = reply
            .payload_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(|jid| jid.text())
            .ok_or_else(|| XmppError::protocol("bind result carries no JID"))?;
        return text
            .trim()
            .parse::<FullJid>()
            .map_err(|e| XmppError::invalid_address(text.trim(), e));
    }
}
