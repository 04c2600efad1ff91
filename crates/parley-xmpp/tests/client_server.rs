//! Client streams against a server session, both ends of this crate.
//!
//! Run with: `cargo test -p parley-xmpp --test client_server`

mod common;

use std::sync::Arc;

use common::{builder, plain_config, TestServer, TestTlsCredentials, DEFAULT_TIMEOUT, DOMAIN};
use minidom::{Element, Node};
use parley_xmpp::{
    ns, BoxedIo, ClientConfig, ClientStream, Credentials, MechanismRegistry, Packet, SecureChannel,
    Stanza, StaticAuthenticator, StreamConfig, TlsPolicy, XmppError,
};
use tokio::time::timeout;

fn client_mechanisms() -> Arc<MechanismRegistry> {
    Arc::new(MechanismRegistry::standard(Arc::new(StaticAuthenticator::new())))
}

async fn connect(
    server: &TestServer,
    config: ClientConfig,
    channel: Option<Arc<dyn SecureChannel>>,
) -> Result<ClientStream, XmppError> {
    let (io, _session) = server.connect_io();
    let io: BoxedIo = Box::new(io);
    timeout(
        DEFAULT_TIMEOUT,
        ClientStream::connect(io, config, client_mechanisms(), channel),
    )
    .await
    .expect("negotiation timed out")
}

fn plain_client(username: &str, password: &str, resource: &str) -> ClientConfig {
    let mut config = ClientConfig::new(DOMAIN, Credentials::new(username, password));
    config.tls = TlsPolicy::Disabled;
    config.resource = Some(resource.to_string());
    config
}

fn chat(to: &str, body: &str) -> Packet {
    Packet::Message(
        Stanza::new(ns::JABBER_CLIENT)
            .with_type("chat")
            .with_to(to)
            .with_payload(
                Element::builder("body", ns::JABBER_CLIENT)
                    .append(Node::Text(body.to_string()))
                    .build(),
            ),
    )
}

async fn next_message(client: &mut ClientStream) -> Stanza {
    loop {
        let packet = timeout(DEFAULT_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream failed")
            .expect("stream closed");
        if let Packet::Message(message) = packet {
            return message;
        }
    }
}

#[tokio::test]
async fn test_scram_over_starttls() {
    let credentials = TestTlsCredentials::generate(DOMAIN);
    let mut config = StreamConfig::for_domain(DOMAIN);
    config.idle_timeout_secs = 0;
    let context = builder(config)
        .secure_channel(credentials.acceptor())
        .build()
        .unwrap();
    let server = TestServer::new(context);

    let mut client_config = ClientConfig::new(DOMAIN, Credentials::new("alice", "secret"));
    client_config.resource = Some("laptop".to_string());
    let client = connect(&server, client_config, Some(credentials.connector(DOMAIN)))
        .await
        .unwrap();

    assert!(client.is_secure());
    assert_eq!(client.jid().to_string(), "alice@example.com/laptop");
    assert!(client.stream_id().is_some());
    assert!(server
        .context
        .sessions
        .is_bound(&"alice@example.com/laptop".parse().unwrap()));

    client.close().await.unwrap();
    assert!(server.context.sessions.is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let credentials = TestTlsCredentials::generate(DOMAIN);
    let context = builder(StreamConfig::for_domain(DOMAIN))
        .secure_channel(credentials.acceptor())
        .build()
        .unwrap();
    let server = TestServer::new(context);

    let client_config = ClientConfig::new(DOMAIN, Credentials::new("alice", "wrong"));
    let result = connect(&server, client_config, Some(credentials.connector(DOMAIN))).await;
    assert!(matches!(result, Err(XmppError::Sasl { .. })));
}

#[tokio::test]
async fn test_client_requiring_tls_refuses_plaintext_server() {
    let server = TestServer::plain();

    let client_config = ClientConfig::new(DOMAIN, Credentials::new("alice", "secret"));
    let result = connect(&server, client_config, None).await;
    assert!(matches!(result, Err(XmppError::Protocol(_))));
}

#[tokio::test]
async fn test_server_assigns_resource() {
    let server = TestServer::plain();

    let mut client_config = plain_client("bob", "hunter2", "unused");
    client_config.resource = None;
    let client = connect(&server, client_config, None).await.unwrap();

    assert_eq!(client.jid().node().map(|n| n.as_str()), Some("bob"));
    assert!(client.jid().resource().as_str().starts_with("parley-"));
}

#[tokio::test]
async fn test_chat_between_clients() {
    let server = TestServer::plain();

    let mut alice = connect(&server, plain_client("alice", "secret", "home"), None)
        .await
        .unwrap();
    let mut bob = connect(&server, plain_client("bob", "hunter2", "phone"), None)
        .await
        .unwrap();
    assert_eq!(server.context.sessions.len(), 2);

    alice.send(&chat("bob@example.com", "hello bob")).unwrap();
    let received = next_message(&mut bob).await;
    assert_eq!(received.from.as_deref(), Some("alice@example.com/home"));
    let body = received.payload_child("body", ns::JABBER_CLIENT).unwrap();
    assert_eq!(body.text(), "hello bob");

    // A spoofed sender is overwritten with the bound JID.
    let mut spoofed = chat("alice@example.com/home", "it's me");
    if let Packet::Message(stanza) = &mut spoofed {
        stanza.from = Some("carol@example.com/x".to_string());
    }
    bob.send(&spoofed).unwrap();
    let received = next_message(&mut alice).await;
    assert_eq!(received.from.as_deref(), Some("bob@example.com/phone"));

    alice.send(&chat("nobody@example.com", "anyone?")).unwrap();
    let bounce = next_message(&mut alice).await;
    assert!(bounce.is_error());

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    assert!(server.context.sessions.is_empty());
}

#[tokio::test]
async fn test_remote_domain_is_unreachable() {
    let server = TestServer::plain();
    let mut alice = connect(&server, plain_client("alice", "secret", "home"), None)
        .await
        .unwrap();

    alice.send(&chat("someone@elsewhere.org", "hi")).unwrap();
    let bounce = next_message(&mut alice).await;
    assert!(bounce.is_error());
    let error = bounce.payload_child("error", ns::JABBER_CLIENT).unwrap();
    assert!(error.has_child("remote-server-not-found", ns::STANZAS));
}

#[tokio::test]
async fn test_shutdown_ends_client_streams() {
    let context = builder(plain_config()).build().unwrap();
    let server = TestServer::new(context);
    let mut alice = connect(&server, plain_client("alice", "secret", "home"), None)
        .await
        .unwrap();

    server.shutdown();

    let result = timeout(DEFAULT_TIMEOUT, alice.next())
        .await
        .expect("timed out waiting for shutdown");
    match result {
        Ok(Some(Packet::StreamError(error))) => {
            assert_eq!(error.condition.as_str(), "system-shutdown");
        }
        other => panic!("expected a stream error, got {other:?}"),
    }
}
