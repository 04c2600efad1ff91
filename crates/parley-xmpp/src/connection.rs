//! Stream sessions.
//!
//! A [`Session`] owns one connection: the decoder over its read half and the
//! writer task over its write half. Decoded packets are handed to the
//! [`StreamContext`], which checks sequencing, runs the dispatcher and owns
//! the negotiation state. The session loop only acts on what the context asks
//! for between packets: a TLS upgrade or a stream restart.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use jid::{BareJid, FullJid};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn, Span};
use uuid::Uuid;

use crate::auth::SaslNegotiation;
use crate::config::StreamConfig;
use crate::dispatcher::{classify, DispatchOutcome, EventCategory};
use crate::packet::Packet;
use crate::parser::{Decoder, StreamHeader};
use crate::registry::SessionRegistry;
use crate::server::ServerContext;
use crate::stream::{spawn_writer, BoxedIo, IdleProbe, Outbound, Transport};
use crate::types::{SessionState, StreamVersion, UnknownElementPolicy};
use crate::{DecodeError, StanzaErrorCondition, StanzaErrorType, StreamErrorCondition, XmppError};

type SessionReader = BufReader<IdleProbe<ReadHalf<BoxedIo>>>;
type WriterTask = JoinHandle<io::Result<WriteHalf<BoxedIo>>>;

/// Work the session loop must do before reading the next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    /// `<proceed/>` is queued; hand the transport to the secure channel
    UpgradeTls,
    /// A new stream header is due; reset the decoder
    Restart,
}

/// Negotiation state of one session, as seen by event handlers.
pub struct StreamContext {
    pub(crate) shared: Arc<ServerContext>,
    pub(crate) state: SessionState,
    pub(crate) sasl: SaslNegotiation,
    pub(crate) outbound: Outbound,
    pub(crate) stream_id: Option<String>,
    /// Our opening tag is on this transport and still needs its closing tag
    pub(crate) header_sent: bool,
    pub(crate) identity: Option<BareJid>,
    pub(crate) bound: Option<FullJid>,
    pub(crate) pending: Option<Pending>,
    /// Connection span; `jid` is recorded on it after bind
    pub(crate) span: Span,
    conn_id: Uuid,
    peer: Option<SocketAddr>,
}

impl StreamContext {
    pub(crate) fn new(
        shared: Arc<ServerContext>,
        outbound: Outbound,
        conn_id: Uuid,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            shared,
            state: SessionState::default(),
            sasl: SaslNegotiation::new(),
            outbound,
            stream_id: None,
            header_sent: false,
            identity: None,
            bound: None,
            pending: None,
            span: Span::current(),
            conn_id,
            peer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    /// Id of the current stream, once our header has been sent.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// The authenticated account.
    pub fn identity(&self) -> Option<&BareJid> {
        self.identity.as_ref()
    }

    /// The bound full JID.
    pub fn bound_jid(&self) -> Option<&FullJid> {
        self.bound.as_ref()
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Process one decoded packet.
    pub fn handle(&mut self, packet: Packet) {
        if self.state.closed {
            trace!(element = %packet.qname(), "Element received after close");
            return;
        }

        let category = classify(&packet);
        if !self.check_sequence(category) {
            return;
        }

        if category == EventCategory::Unrecognized
            && self.shared.config.unknown_elements == UnknownElementPolicy::Reject
        {
            self.fail(
                StreamErrorCondition::UnsupportedStanzaType,
                Some(format!("{} is not supported", packet.qname())),
            );
            return;
        }

        let shared = Arc::clone(&self.shared);
        if shared.dispatcher.dispatch(category, self, &packet) == DispatchOutcome::Ignored {
            self.on_ignored(category, &packet);
        }
    }

    /// Reject packets that arrive at the wrong point of the negotiation.
    fn check_sequence(&mut self, category: EventCategory) -> bool {
        match category {
            EventCategory::StreamOpen if self.state.started => {
                self.fail(
                    StreamErrorCondition::BadFormat,
                    Some("stream is already open".to_string()),
                );
                false
            }
            EventCategory::StreamOpen | EventCategory::StreamClose | EventCategory::StreamError => {
                true
            }
            _ if !self.state.started => {
                self.fail(
                    StreamErrorCondition::BadFormat,
                    Some("element received before the stream header".to_string()),
                );
                false
            }
            EventCategory::InfoQuery if !self.state.authenticated => {
                self.fail(
                    StreamErrorCondition::NotAuthorized,
                    Some("authentication required".to_string()),
                );
                false
            }
            EventCategory::Message | EventCategory::Presence if self.bound.is_none() => {
                self.fail(
                    StreamErrorCondition::NotAuthorized,
                    Some("resource binding required".to_string()),
                );
                false
            }
            _ => true,
        }
    }

    fn on_ignored(&mut self, category: EventCategory, packet: &Packet) {
        match (category, packet) {
            (EventCategory::StreamOpen | EventCategory::SecureChannel | EventCategory::Auth, _) => {
                self.fail(
                    StreamErrorCondition::UnsupportedFeature,
                    Some(format!("no handler for {}", packet.qname())),
                );
            }
            (EventCategory::InfoQuery, Packet::Iq(iq))
                if iq.iq_type().is_some_and(|t| t.is_request()) =>
            {
                debug!(id = ?iq.id, "Unhandled IQ request");
                self.send(&Packet::Iq(iq.error_reply(
                    StanzaErrorCondition::ServiceUnavailable,
                    StanzaErrorType::Cancel,
                    None,
                )));
            }
            (EventCategory::Compression, Packet::Compress(_)) => {
                self.send(&Packet::CompressFailure("unsupported-method".to_string()));
            }
            _ => debug!(category = %category, element = %packet.qname(), "Event ignored"),
        }
    }

    /// Queue a packet. A failed enqueue ends the session.
    pub fn send(&mut self, packet: &Packet) -> bool {
        self.send_raw(packet.to_xml())
    }

    fn send_raw(&mut self, xml: String) -> bool {
        if self.state.closed {
            return false;
        }
        match self.outbound.send_raw(xml) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Output queue closed");
                self.abort();
                false
            }
        }
    }

    /// Send our stream header for a stream speaking `version`.
    pub(crate) fn send_header(&mut self, to: Option<String>, version: StreamVersion) {
        let config = &self.shared.config;
        let id = Uuid::new_v4().to_string();

        let mut header = StreamHeader::outbound(config.role.content_namespace());
        header.from = Some(config.domain.clone());
        header.to = to;
        header.id = Some(id.clone());
        header.version = (version >= StreamVersion::V1_0).then(|| version.to_string());
        header.lang = Some(config.lang.clone());

        if self.send_raw(format!("<?xml version='1.0'?>{}", header.to_xml())) {
            debug!(stream_id = %id, "Sent stream header");
            self.stream_id = Some(id);
            self.header_sent = true;
        }
    }

    /// Forget the current stream; the peer must open a new one.
    ///
    /// Our previous opening tag stays open on the transport.
    pub(crate) fn restart_stream(&mut self) {
        self.state.restart();
        self.stream_id = None;
    }

    /// Close the stream with a stream error.
    ///
    /// Our header goes out first if the current stream has none yet.
    pub fn fail(&mut self, condition: StreamErrorCondition, text: Option<String>) {
        if self.state.closed {
            return;
        }
        warn!(condition = %condition, text = ?text, "Closing stream with error");
        if self.stream_id.is_none() {
            let version = self.shared.config.version;
            self.send_header(None, version);
        }
        self.send(&Packet::stream_error(condition, text));
        self.close();
    }

    /// Close the stream. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if self.header_sent {
            if let Err(e) = self.outbound.send_closing_tag() {
                debug!(error = %e, "Could not queue closing tag");
            }
        }
        self.release();
    }

    /// Tear down without writing anything.
    pub(crate) fn abort(&mut self) {
        if self.state.closed {
            return;
        }
        self.release();
    }

    fn release(&mut self) {
        self.state.closed = true;
        if let Some(jid) = &self.bound {
            self.shared.sessions.unregister(jid, self.conn_id);
        }
        self.outbound.close();
        debug!("Session closed");
    }
}

/// One connection, from accept to close.
pub struct Session {
    ctx: StreamContext,
    decoder: Option<Decoder<SessionReader>>,
    writer: Option<WriterTask>,
    shutdown: Option<CancellationToken>,
}

impl Session {
    /// Set up a session over `transport`. Must be called inside a tokio runtime.
    pub fn new(transport: Transport, shared: Arc<ServerContext>) -> Self {
        let (outbound, decoder, writer) = attach(transport.io, &shared);
        Self {
            ctx: StreamContext::new(shared, outbound, transport.id, transport.peer),
            decoder: Some(decoder),
            writer: Some(writer),
            shutdown: None,
        }
    }

    /// Close with `system-shutdown` when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    /// Run until the stream ends. Returns the final negotiation state.
    #[instrument(name = "xmpp.session.run", skip(self), fields(conn_id = %self.ctx.conn_id))]
    pub async fn run(mut self) -> Result<SessionState, XmppError> {
        let result = self.process().await;
        self.finish().await;
        result.map(|()| self.ctx.state)
    }

    async fn process(&mut self) -> Result<(), XmppError> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(());
            };

            let next = match &self.shutdown {
                Some(token) => tokio::select! {
                    next = decoder.next() => next,
                    _ = token.cancelled() => {
                        info!("Server shutting down");
                        self.ctx.fail(StreamErrorCondition::SystemShutdown, None);
                        return Ok(());
                    }
                },
                None => decoder.next().await,
            };

            match next {
                Ok(Some(packet)) => {
                    self.ctx.handle(packet);
                    if self.ctx.state.closed {
                        return Ok(());
                    }
                    match self.ctx.pending.take() {
                        Some(Pending::UpgradeTls) => self.upgrade_tls().await?,
                        Some(Pending::Restart) => self.restart_decoder(),
                        None => {}
                    }
                }
                Ok(None) => {
                    debug!("Peer closed the connection");
                    self.ctx.abort();
                    return Ok(());
                }
                Err(DecodeError::Io(e)) => {
                    debug!(error = %e, "Transport error");
                    self.ctx.abort();
                    return Err(e.into());
                }
                Err(e) => {
                    let condition = e.condition().unwrap_or(StreamErrorCondition::UndefinedCondition);
                    self.ctx.fail(condition, Some(e.to_string()));
                    return Ok(());
                }
            }
        }
    }

    /// Swap the plaintext transport for an encrypted one.
    #[instrument(name = "xmpp.session.starttls", skip(self))]
    async fn upgrade_tls(&mut self) -> Result<(), XmppError> {
        let channel = self
            .ctx
            .shared
            .secure_channel
            .clone()
            .ok_or_else(|| XmppError::internal("no secure channel provider"))?;

        // Let the writer flush <proceed/> and hand back the write half.
        self.ctx.outbound.close();
        let write_half = self.reclaim_writer().await?;

        let reader = self
            .decoder
            .take()
            .ok_or_else(|| XmppError::internal("decoder missing"))?
            .into_inner();
        if !reader.buffer().is_empty() {
            self.ctx.abort();
            return Err(XmppError::protocol("data received before the TLS handshake"));
        }
        let read_half = reader.into_inner().into_inner();

        let io = match channel.upgrade(read_half.unsplit(write_half)).await {
            Ok(io) => io,
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                self.ctx.abort();
                return Err(e);
            }
        };

        let (outbound, decoder, writer) = attach(io, &self.ctx.shared);
        self.ctx.outbound = outbound;
        self.decoder = Some(decoder);
        self.writer = Some(writer);
        self.ctx.state.secure = true;
        self.ctx.restart_stream();
        self.ctx.header_sent = false;
        info!("TLS established");
        Ok(())
    }

    /// Start a fresh decoder over the same reader, keeping buffered bytes.
    fn restart_decoder(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            let elements = Arc::clone(&self.ctx.shared.elements);
            self.decoder = Some(Decoder::new(decoder.into_inner(), elements));
            debug!("Stream restarted");
        }
    }

    async fn reclaim_writer(&mut self) -> Result<WriteHalf<BoxedIo>, XmppError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| XmppError::internal("writer missing"))?;
        match writer.await {
            Ok(Ok(write_half)) => Ok(write_half),
            Ok(Err(e)) => {
                self.ctx.abort();
                Err(e.into())
            }
            Err(e) => {
                self.ctx.abort();
                Err(XmppError::internal(format!("writer task failed: {e}")))
            }
        }
    }

    async fn finish(&mut self) {
        self.ctx.close();
        self.decoder = None;
        if self.writer.is_none() {
            return;
        }
        match self.reclaim_writer().await {
            Ok(mut write_half) => {
                if let Err(e) = write_half.shutdown().await {
                    trace!(error = %e, "Transport shutdown failed");
                }
            }
            Err(e) => debug!(error = %e, "Writer ended with an error"),
        }
    }
}

/// Split `io` and start its writer and decoder.
fn attach(io: BoxedIo, shared: &ServerContext) -> (Outbound, Decoder<SessionReader>, WriterTask) {
    let (read_half, write_half) = tokio::io::split(io);
    let (outbound, writer) = spawn_writer(write_half);
    let reader = BufReader::new(IdleProbe::new(
        read_half,
        shared.config.idle_timeout(),
        outbound.probe(),
    ));
    let decoder = Decoder::new(reader, Arc::clone(&shared.elements));
    (outbound, decoder, writer)
}
