//! Test utilities for stream-level integration tests.
//!
//! Provides an in-memory transport to a real [`Session`], a raw XML client
//! for byte-exact assertions, and self-signed TLS credentials.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use parley_xmpp::auth::StaticAuthenticator;
use parley_xmpp::{
    RustlsAcceptor, RustlsConnector, SecureChannel, ServerContext, ServerContextBuilder, Session,
    SessionState, StreamConfig, TlsPolicy, Transport, XmppError,
};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DOMAIN: &str = "example.com";

/// Client stream header addressed to [`DOMAIN`].
pub const CLIENT_HEADER: &str = "<?xml version='1.0'?><stream:stream to='example.com' \
    xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Stream settings for tests: plaintext, PLAIN only, no keepalive.
pub fn plain_config() -> StreamConfig {
    let mut config = StreamConfig::for_domain(DOMAIN);
    config.tls = TlsPolicy::Disabled;
    config.mechanisms = vec!["PLAIN".to_string()];
    config.idle_timeout_secs = 0;
    config
}

/// Builder preloaded with `alice/secret` and `bob/hunter2`.
pub fn builder(config: StreamConfig) -> ServerContextBuilder {
    let users = StaticAuthenticator::new()
        .with_user("alice", "secret")
        .with_user("bob", "hunter2");
    ServerContext::builder(config).authenticator(Arc::new(users))
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
        }
    }

    /// Server side of the channel.
    pub fn acceptor(&self) -> Arc<dyn SecureChannel> {
        Arc::new(
            RustlsAcceptor::from_pem(&self.cert_pem, &self.key_pem)
                .expect("Failed to build acceptor"),
        )
    }

    /// Client side of the channel, trusting only this certificate.
    pub fn connector(&self, domain: &str) -> Arc<dyn SecureChannel> {
        Arc::new(
            RustlsConnector::with_trusted_pem(&self.cert_pem, domain)
                .expect("Failed to build connector"),
        )
    }
}

/// Runs sessions over in-memory pipes.
pub struct TestServer {
    pub context: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl TestServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        init_tracing();
        Self {
            context,
            shutdown: CancellationToken::new(),
        }
    }

    /// Plaintext server accepting PLAIN.
    pub fn plain() -> Self {
        Self::new(builder(plain_config()).build().expect("Failed to build context"))
    }

    /// Start a session and return the peer end of its transport.
    pub fn connect_io(&self) -> (DuplexStream, JoinHandle<Result<SessionState, XmppError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = Session::new(Transport::new(server), Arc::clone(&self.context))
            .with_shutdown(self.shutdown.child_token());
        (client, tokio::spawn(session.run()))
    }

    /// Start a session driven by a raw client.
    pub fn connect(&self) -> (RawXmppClient, JoinHandle<Result<SessionState, XmppError>>) {
        let (io, session) = self.connect_io();
        (RawXmppClient::new(io), session)
    }

    /// Close every session with `system-shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Speaks raw XML to a session.
pub struct RawXmppClient {
    io: DuplexStream,
    buffer: String,
}

impl RawXmppClient {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: String::new(),
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.io
            .write_all(xml.as_bytes())
            .await
            .expect("Failed to write to session");
    }

    /// Read until `needle` has been received. Returns everything up to and
    /// including it; the rest stays buffered.
    pub async fn read_until(&mut self, needle: &str) -> String {
        loop {
            if let Some(pos) = self.buffer.find(needle) {
                let end = pos + needle.len();
                return self.buffer.drain(..end).collect();
            }
            let read = self.read_some().await;
            assert!(
                read > 0,
                "stream ended before {needle:?} arrived; received {:?}",
                self.buffer
            );
        }
    }

    /// Read until the session closes the transport.
    pub async fn read_to_end(&mut self) -> String {
        while self.read_some().await > 0 {}
        std::mem::take(&mut self.buffer)
    }

    async fn read_some(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let read = timeout(DEFAULT_TIMEOUT, self.io.read(&mut chunk))
            .await
            .unwrap_or_else(|_| panic!("timed out; received so far: {:?}", self.buffer))
            .expect("Failed to read from session");
        self.buffer
            .push_str(std::str::from_utf8(&chunk[..read]).expect("session sent invalid UTF-8"));
        read
    }

    /// Open a stream and read the header and features.
    pub async fn open(&mut self) -> String {
        self.send(CLIENT_HEADER).await;
        self.read_until("</stream:features>").await
    }

    /// Open, authenticate with PLAIN and restart. Returns the post-auth features.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> String {
        use base64::prelude::*;

        self.open().await;
        let token = BASE64_STANDARD.encode(format!("\0{username}\0{password}"));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{token}</auth>"
        ))
        .await;
        self.read_until("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        self.open().await
    }

    /// Authenticate and bind `resource`. Returns the bind result.
    pub async fn bind(&mut self, username: &str, password: &str, resource: &str) -> String {
        self.authenticate(username, password).await;
        self.send(&format!(
            "<iq type='set' id='bind'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{resource}</resource></bind></iq>"
        ))
        .await;
        self.read_until("</iq>").await
    }

    pub fn into_inner(self) -> DuplexStream {
        self.io
    }
}
