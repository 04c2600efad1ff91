//! Server assembly and the TCP listener.
//!
//! A [`ServerContext`] bundles everything sessions share: configuration, the
//! element and mechanism registries, the dispatcher, the session registry and
//! the pluggable stanza handler and secure channel. It is built once, before
//! accepting, and is read-only afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{Authenticator, MechanismRegistry, StaticAuthenticator};
use crate::config::StreamConfig;
use crate::connection::{Session, StreamContext};
use crate::dispatcher::{Dispatcher, EventCategory};
use crate::negotiation::standard_dispatcher;
use crate::packet::Packet;
use crate::registry::{ElementRegistry, SessionRegistry};
use crate::routing::{LocalRouter, StanzaHandler};
use crate::stream::Transport;
use crate::tls::SecureChannel;
use crate::types::TlsPolicy;
use crate::XmppError;

/// State shared by every session of a server.
pub struct ServerContext {
    pub config: StreamConfig,
    pub elements: Arc<ElementRegistry>,
    pub mechanisms: MechanismRegistry,
    pub dispatcher: Dispatcher<StreamContext>,
    pub sessions: Arc<SessionRegistry>,
    pub stanza_handler: Arc<dyn StanzaHandler>,
    pub secure_channel: Option<Arc<dyn SecureChannel>>,
}

impl ServerContext {
    pub fn builder(config: StreamConfig) -> ServerContextBuilder {
        ServerContextBuilder::new(config)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("elements", &self.elements.len())
            .field("mechanisms", &self.mechanisms)
            .field("dispatcher", &self.dispatcher)
            .field("sessions", &self.sessions)
            .field("secure_channel", &self.secure_channel.is_some())
            .finish_non_exhaustive()
    }
}

type PendingHandler = (
    EventCategory,
    Box<dyn Fn(&mut StreamContext, &Packet) -> bool + Send + Sync>,
);

/// Builder for [`ServerContext`].
pub struct ServerContextBuilder {
    config: StreamConfig,
    elements: Option<ElementRegistry>,
    authenticator: Option<Arc<dyn Authenticator>>,
    mechanisms: Option<MechanismRegistry>,
    handlers: Vec<PendingHandler>,
    sessions: Option<Arc<SessionRegistry>>,
    stanza_handler: Option<Arc<dyn StanzaHandler>>,
    secure_channel: Option<Arc<dyn SecureChannel>>,
}

impl ServerContextBuilder {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            elements: None,
            authenticator: None,
            mechanisms: None,
            handlers: Vec::new(),
            sessions: None,
            stanza_handler: None,
            secure_channel: None,
        }
    }

    /// Credential store for the standard mechanisms.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Replace the standard mechanisms entirely.
    pub fn mechanisms(mut self, mechanisms: MechanismRegistry) -> Self {
        self.mechanisms = Some(mechanisms);
        self
    }

    /// Replace the standard element registry.
    pub fn elements(mut self, elements: ElementRegistry) -> Self {
        self.elements = Some(elements);
        self
    }

    /// Register a handler ahead of the built-in ones for `category`.
    pub fn on<F>(mut self, category: EventCategory, handler: F) -> Self
    where
        F: Fn(&mut StreamContext, &Packet) -> bool + Send + Sync + 'static,
    {
        self.handlers.push((category, Box::new(handler)));
        self
    }

    pub fn stanza_handler(mut self, handler: Arc<dyn StanzaHandler>) -> Self {
        self.stanza_handler = Some(handler);
        self
    }

    pub fn secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure_channel = Some(channel);
        self
    }

    /// Share a session registry with other servers or the application.
    pub fn sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> Result<Arc<ServerContext>, XmppError> {
        self.config.validate()?;

        match (self.config.tls, &self.secure_channel) {
            (TlsPolicy::Required, None) => {
                return Err(XmppError::config(
                    "TLS is required but no secure channel was configured",
                ));
            }
            (TlsPolicy::Optional, None) => {
                warn!("TLS is optional but no secure channel was configured; STARTTLS will not be offered");
            }
            _ => {}
        }

        let mut mechanisms = match self.mechanisms {
            Some(mechanisms) => mechanisms,
            None => {
                let authenticator = self
                    .authenticator
                    .unwrap_or_else(|| Arc::new(StaticAuthenticator::new()));
                MechanismRegistry::standard(authenticator)
            }
        };
        mechanisms.retain_server(&self.config.mechanisms);
        if mechanisms.server_mechanisms().is_empty() {
            return Err(XmppError::config(format!(
                "none of the enabled mechanisms {:?} are available",
                self.config.mechanisms
            )));
        }

        let mut dispatcher = standard_dispatcher();
        for (category, handler) in self.handlers {
            dispatcher.add_handler(category, handler);
        }

        let context = ServerContext {
            elements: Arc::new(self.elements.unwrap_or_else(ElementRegistry::standard)),
            mechanisms,
            dispatcher,
            sessions: self.sessions.unwrap_or_default(),
            stanza_handler: self
                .stanza_handler
                .unwrap_or_else(|| Arc::new(LocalRouter::new())),
            secure_channel: self.secure_channel,
            config: self.config,
        };
        debug!(context = ?context, "Server context built");
        Ok(Arc::new(context))
    }
}

/// Accepts TCP connections and runs a [`Session`] for each.
#[derive(Debug, Clone)]
pub struct XmppServer {
    context: Arc<ServerContext>,
}

impl XmppServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Cancelling also closes every running session with `system-shutdown`.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, domain = %self.context.config.domain, "XMPP server listening");

        let mut backoff = AcceptBackoff::default();
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        backoff.reset();
                        conn
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in = ?delay, "Failed to accept connection");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Could not disable Nagle's algorithm");
            }
            self.spawn_session(Transport::from_tcp(stream), shutdown.child_token());
            debug!(peer = %peer_addr, "Connection accepted");
        }

        info!("XMPP server stopped accepting connections");
        Ok(())
    }

    /// Run a session over an already established transport.
    pub fn spawn_session(
        &self,
        transport: Transport,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let span = info_span!(
            "xmpp.connection",
            peer = ?transport.peer,
            conn_id = %transport.id,
            jid = tracing::field::Empty,
        );
        let context = Arc::clone(&self.context);

        tokio::spawn(
            async move {
                let session = Session::new(transport, context).with_shutdown(shutdown);
                match session.run().await {
                    Ok(state) => debug!(authenticated = state.authenticated, "Connection finished"),
                    Err(e) => warn!(error = %e, "Connection error"),
                }
            }
            .instrument(span),
        )
    }
}

/// Retry delay after a failed `accept()`, doubling from 10ms up to 1s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = Self::INITIAL;
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }
}
