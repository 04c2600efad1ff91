//! SASL authentication framework.
//!
//! Mechanisms are registered by name in a [`MechanismRegistry`] as factories,
//! one per protocol role. A session keeps at most one active server-side
//! handler in its [`SaslNegotiation`] slot; the framework decodes the base64
//! payloads and turns every failure into a `<failure/>` element, so
//! mechanisms only ever see raw bytes.
//!
//! Shipped mechanisms:
//! - PLAIN (RFC 4616)
//! - SCRAM-SHA-256 (RFC 5802, RFC 7677)

pub mod plain;
pub mod scram;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

pub use plain::{PlainClient, PlainServer};
pub use scram::{
    encode_sasl_name, generate_salt, generate_scram_keys, ScramCredentials, ScramSha256Client,
    ScramSha256Server, DEFAULT_ITERATIONS,
};

use crate::error::SaslCondition;
use crate::packet::{Packet, SaslFailure, SaslPayload};
use crate::XmppError;

/// Result of one server-side negotiation step.
///
/// `reply` is always sent to the peer. `error` ends the negotiation and
/// discards the handler; `identity` reports success.
#[derive(Debug)]
pub struct ServerStep {
    pub identity: Option<String>,
    pub reply: Packet,
    pub error: Option<XmppError>,
}

impl ServerStep {
    /// Ask the client for more data.
    pub fn challenge(data: &[u8]) -> Self {
        Self {
            identity: None,
            reply: Packet::SaslChallenge(SaslPayload::from_bytes(data)),
            error: None,
        }
    }

    /// Authentication succeeded for `identity`, with optional additional data.
    pub fn success(identity: impl Into<String>, additional: &[u8]) -> Self {
        let payload = if additional.is_empty() {
            SaslPayload::default()
        } else {
            SaslPayload::from_bytes(additional)
        };
        Self {
            identity: Some(identity.into()),
            reply: Packet::SaslSuccess(payload),
            error: None,
        }
    }

    /// Authentication failed with `condition`.
    pub fn failure(condition: SaslCondition, text: impl Into<String>) -> Self {
        Self {
            identity: None,
            reply: Packet::sasl_failure(condition),
            error: Some(XmppError::Sasl {
                condition,
                text: Some(text.into()),
            }),
        }
    }
}

/// Server side of a mechanism. One instance serves one negotiation.
pub trait ServerMechanism: Send {
    /// Handle `<auth/>` with its (possibly empty) initial response.
    fn auth(&mut self, initial: &[u8]) -> ServerStep;

    /// Handle a `<response/>` to our last challenge.
    fn response(&mut self, data: &[u8]) -> ServerStep;

    /// The client gave up.
    fn abort(&mut self) -> (Packet, Option<XmppError>) {
        (
            Packet::sasl_failure(SaslCondition::Aborted),
            Some(XmppError::Sasl {
                condition: SaslCondition::Aborted,
                text: None,
            }),
        )
    }
}

/// Client side of a mechanism. One instance serves one negotiation.
pub trait ClientMechanism: Send {
    /// The `<auth/>` element that starts the exchange.
    fn begin(&mut self) -> Result<Packet, XmppError>;

    /// Answer a server challenge with a `<response/>`.
    fn challenge(&mut self, data: &[u8]) -> Result<Packet, XmppError>;

    /// Check the additional data of `<success/>`.
    fn success(&mut self, data: &[u8]) -> Result<(), XmppError>;

    /// The server rejected us.
    fn failure(&mut self, failure: &SaslFailure) -> Result<(), XmppError> {
        Err(XmppError::Sasl {
            condition: failure.condition.unwrap_or(SaslCondition::NotAuthorized),
            text: failure.text.clone(),
        })
    }

    /// Give up on the exchange.
    fn abort(&mut self) -> Result<Packet, XmppError> {
        Ok(Packet::SaslAbort)
    }
}

/// What a client authenticates with.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub authzid: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            authzid: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("authzid", &self.authzid)
            .finish_non_exhaustive()
    }
}

/// Credential store consulted by the server-side mechanisms.
pub trait Authenticator: Send + Sync {
    /// Check a plaintext password.
    fn verify_plain(&self, username: &str, password: &str) -> bool;

    /// Stored SCRAM-SHA-256 keys for `username`, if the user exists.
    fn scram_credentials(&self, username: &str) -> Option<ScramCredentials>;
}

/// In-memory [`Authenticator`] fed from configuration.
#[derive(Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, StaticUser>,
}

struct StaticUser {
    /// SHA-256 of the password, compared in constant time
    password_digest: Vec<u8>,
    scram: ScramCredentials,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user. SCRAM keys are derived with a fresh salt.
    pub fn add_user(&mut self, username: impl Into<String>, password: impl Into<String>) {
        let password = password.into();
        let scram = ScramCredentials::derive(&password, generate_salt(), DEFAULT_ITERATIONS);
        let password_digest = scram::sha256(password.as_bytes());
        self.users.insert(
            username.into(),
            StaticUser {
                password_digest,
                scram,
            },
        );
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.add_user(username, password);
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    fn verify_plain(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|user| {
                scram::constant_time_eq(&scram::sha256(password.as_bytes()), &user.password_digest)
            })
    }

    fn scram_credentials(&self, username: &str) -> Option<ScramCredentials> {
        self.users.get(username).map(|user| user.scram.clone())
    }
}

impl fmt::Debug for StaticAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuthenticator")
            .field("user_count", &self.users.len())
            .finish()
    }
}

pub type ServerFactory = Arc<dyn Fn() -> Box<dyn ServerMechanism> + Send + Sync>;
pub type ClientFactory = Arc<dyn Fn(&Credentials) -> Box<dyn ClientMechanism> + Send + Sync>;

/// Named mechanism factories for both roles.
///
/// Names are matched case-insensitively and kept in registration order,
/// which is the order they are advertised in.
#[derive(Default, Clone)]
pub struct MechanismRegistry {
    server: Vec<(String, ServerFactory)>,
    client: Vec<(String, ClientFactory)>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// PLAIN and SCRAM-SHA-256 for both roles, strongest first.
    pub fn standard(authenticator: Arc<dyn Authenticator>) -> Self {
        let mut registry = Self::new();

        let scram_auth = Arc::clone(&authenticator);
        registry.register_server(scram::MECHANISM, move || {
            Box::new(ScramSha256Server::new(Arc::clone(&scram_auth)))
        });
        registry.register_server(plain::MECHANISM, move || {
            Box::new(PlainServer::new(Arc::clone(&authenticator)))
        });

        registry.register_client(scram::MECHANISM, |credentials| {
            Box::new(ScramSha256Client::new(credentials.clone()))
        });
        registry.register_client(plain::MECHANISM, |credentials| {
            Box::new(PlainClient::new(credentials.clone()))
        });

        registry
    }

    /// Register a server-side mechanism, replacing one of the same name.
    pub fn register_server<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn ServerMechanism> + Send + Sync + 'static,
    {
        let name = name.to_ascii_uppercase();
        self.server.retain(|(existing, _)| *existing != name);
        self.server.push((name, Arc::new(factory)));
    }

    /// Register a client-side mechanism, replacing one of the same name.
    pub fn register_client<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Credentials) -> Box<dyn ClientMechanism> + Send + Sync + 'static,
    {
        let name = name.to_ascii_uppercase();
        self.client.retain(|(existing, _)| *existing != name);
        self.client.push((name, Arc::new(factory)));
    }

    /// Keep only the server mechanisms named in `enabled`, in that order.
    pub fn retain_server(&mut self, enabled: &[String]) {
        let mut kept = Vec::with_capacity(enabled.len());
        for name in enabled {
            let name = name.to_ascii_uppercase();
            if let Some(index) = self.server.iter().position(|(n, _)| *n == name) {
                kept.push(self.server.remove(index));
            } else {
                warn!(mechanism = %name, "Enabled mechanism is not registered");
            }
        }
        self.server = kept;
    }

    /// Server mechanism names, in advertisement order.
    pub fn server_mechanisms(&self) -> Vec<String> {
        self.server.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn client_mechanisms(&self) -> Vec<String> {
        self.client.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.server.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// A fresh server handler, or `None` for an unknown name.
    pub fn create_server(&self, name: &str) -> Option<Box<dyn ServerMechanism>> {
        self.server
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, factory)| factory())
    }

    /// A fresh client handler, or `None` for an unknown name.
    pub fn create_client(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> Option<Box<dyn ClientMechanism>> {
        self.client
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, factory)| factory(credentials))
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("server", &self.server_mechanisms())
            .field("client", &self.client_mechanisms())
            .finish()
    }
}

/// Where a negotiation stands after a step.
#[derive(Debug)]
pub enum SaslStatus {
    /// A challenge was sent; the handler stays active
    Continue,
    /// Authenticated as the given identity
    Succeeded(String),
    /// The attempt failed; the handler was discarded
    Failed(XmppError),
}

/// A reply to send plus the resulting status.
#[derive(Debug)]
pub struct SaslOutcome {
    pub reply: Packet,
    pub status: SaslStatus,
}

impl SaslOutcome {
    fn failed(condition: SaslCondition, text: &str) -> Self {
        Self {
            reply: Packet::sasl_failure(condition),
            status: SaslStatus::Failed(XmppError::Sasl {
                condition,
                text: Some(text.to_string()),
            }),
        }
    }
}

/// Per-session slot holding the active server-side mechanism.
#[derive(Default)]
pub struct SaslNegotiation {
    active: Option<(String, Box<dyn ServerMechanism>)>,
    failures: u32,
}

impl SaslNegotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn active_mechanism(&self) -> Option<&str> {
        self.active.as_ref().map(|(name, _)| name.as_str())
    }

    /// Handle `<auth/>`.
    pub fn auth(
        &mut self,
        registry: &MechanismRegistry,
        mechanism: &str,
        payload: &SaslPayload,
    ) -> SaslOutcome {
        if self.active.take().is_some() {
            return self.fail(SaslCondition::MalformedRequest, "negotiation already in progress");
        }

        let initial = match payload.decode() {
            Ok(initial) => initial,
            Err(condition) => return self.fail(condition, "initial response is not base64"),
        };

        let Some(mut handler) = registry.create_server(mechanism) else {
            debug!(mechanism = %mechanism, "Unknown SASL mechanism requested");
            return self.fail(SaslCondition::InvalidMechanism, "mechanism not available");
        };

        let step = handler.auth(&initial);
        self.finish(mechanism.to_ascii_uppercase(), handler, step)
    }

    /// Handle `<response/>`.
    pub fn response(&mut self, payload: &SaslPayload) -> SaslOutcome {
        let Some((name, mut handler)) = self.active.take() else {
            return self.fail(SaslCondition::MalformedRequest, "no negotiation in progress");
        };

        let data = match payload.decode() {
            Ok(data) => data,
            Err(condition) => return self.fail(condition, "response is not base64"),
        };

        let step = handler.response(&data);
        self.finish(name, handler, step)
    }

    /// Handle `<abort/>`.
    pub fn abort(&mut self) -> SaslOutcome {
        let Some((_, mut handler)) = self.active.take() else {
            return self.fail(SaslCondition::Aborted, "no negotiation in progress");
        };

        self.failures += 1;
        let (reply, error) = handler.abort();
        SaslOutcome {
            reply,
            status: SaslStatus::Failed(error.unwrap_or(XmppError::Sasl {
                condition: SaslCondition::Aborted,
                text: None,
            })),
        }
    }

    fn finish(
        &mut self,
        name: String,
        handler: Box<dyn ServerMechanism>,
        step: ServerStep,
    ) -> SaslOutcome {
        if let Some(error) = step.error {
            self.failures += 1;
            debug!(mechanism = %name, error = %error, "SASL step failed");
            return SaslOutcome {
                reply: step.reply,
                status: SaslStatus::Failed(error),
            };
        }

        match step.identity {
            Some(identity) => SaslOutcome {
                reply: step.reply,
                status: SaslStatus::Succeeded(identity),
            },
            None => {
                self.active = Some((name, handler));
                SaslOutcome {
                    reply: step.reply,
                    status: SaslStatus::Continue,
                }
            }
        }
    }

    fn fail(&mut self, condition: SaslCondition, text: &str) -> SaslOutcome {
        self.failures += 1;
        SaslOutcome::failed(condition, text)
    }
}

impl fmt::Debug for SaslNegotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslNegotiation")
            .field("active", &self.active_mechanism())
            .field("failures", &self.failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(StaticAuthenticator::new().with_user("alice", "secret"))
    }

    fn payload(bytes: &[u8]) -> SaslPayload {
        SaslPayload::from_bytes(bytes)
    }

    fn failure_condition(outcome: &SaslOutcome) -> Option<SaslCondition> {
        match &outcome.reply {
            Packet::SaslFailure(failure) => failure.condition,
            _ => None,
        }
    }

    #[test]
    fn test_unknown_mechanism_creates_no_handler() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let auth = authenticator();

        let mut registry = MechanismRegistry::new();
        registry.register_server("PLAIN", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(PlainServer::new(Arc::clone(&auth)))
        });

        let mut negotiation = SaslNegotiation::new();
        let outcome = negotiation.auth(&registry, "DIGEST-MD5", &SaslPayload::default());
        assert_eq!(failure_condition(&outcome), Some(SaslCondition::InvalidMechanism));
        assert!(matches!(outcome.status, SaslStatus::Failed(_)));
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(negotiation.failures(), 1);

        // Lookups on a miss leave the registry unchanged.
        assert!(registry.create_server("DIGEST-MD5").is_none());
        assert_eq!(registry.server_mechanisms(), vec!["PLAIN"]);
    }

    #[test]
    fn test_mechanism_names_are_case_insensitive() {
        let registry = MechanismRegistry::standard(authenticator());
        assert!(registry.has_server("plain"));
        assert!(registry.has_server("Scram-Sha-256"));

        let mut negotiation = SaslNegotiation::new();
        let outcome = negotiation.auth(&registry, "plain", &payload(b"\0alice\0secret"));
        assert!(matches!(outcome.status, SaslStatus::Succeeded(ref id) if id == "alice"));
        assert!(matches!(outcome.reply, Packet::SaslSuccess(_)));
    }

    #[test]
    fn test_retain_server_follows_config_order() {
        let mut registry = MechanismRegistry::standard(authenticator());
        assert_eq!(registry.server_mechanisms(), vec!["SCRAM-SHA-256", "PLAIN"]);

        registry.retain_server(&["plain".to_string(), "X-UNKNOWN".to_string()]);
        assert_eq!(registry.server_mechanisms(), vec!["PLAIN"]);
        // Client mechanisms are untouched.
        assert_eq!(registry.client_mechanisms().len(), 2);
    }

    #[test]
    fn test_bad_base64_is_incorrect_encoding() {
        let registry = MechanismRegistry::standard(authenticator());
        let mut negotiation = SaslNegotiation::new();
        let outcome = negotiation.auth(
            &registry,
            "PLAIN",
            &SaslPayload {
                data: Some("***".into()),
            },
        );
        assert_eq!(failure_condition(&outcome), Some(SaslCondition::IncorrectEncoding));
    }

    #[test]
    fn test_response_without_negotiation() {
        let mut negotiation = SaslNegotiation::new();
        let outcome = negotiation.response(&payload(b"data"));
        assert_eq!(failure_condition(&outcome), Some(SaslCondition::MalformedRequest));
    }

    #[test]
    fn test_abort_without_negotiation() {
        let mut negotiation = SaslNegotiation::new();
        let outcome = negotiation.abort();
        assert_eq!(failure_condition(&outcome), Some(SaslCondition::Aborted));
    }

    #[test]
    fn test_challenge_then_response() {
        let registry = MechanismRegistry::standard(authenticator());
        let mut negotiation = SaslNegotiation::new();

        // PLAIN without an initial response asks for one.
        let outcome = negotiation.auth(&registry, "PLAIN", &SaslPayload::default());
        assert!(matches!(outcome.status, SaslStatus::Continue));
        assert!(matches!(outcome.reply, Packet::SaslChallenge(_)));
        assert_eq!(negotiation.active_mechanism(), Some("PLAIN"));

        let outcome = negotiation.response(&payload(b"\0alice\0secret"));
        assert!(matches!(outcome.status, SaslStatus::Succeeded(_)));
        assert_eq!(negotiation.active_mechanism(), None);
    }

    #[test]
    fn test_abort_discards_active_handler() {
        let registry = MechanismRegistry::standard(authenticator());
        let mut negotiation = SaslNegotiation::new();
        negotiation.auth(&registry, "PLAIN", &SaslPayload::default());

        let outcome = negotiation.abort();
        assert_eq!(failure_condition(&outcome), Some(SaslCondition::Aborted));
        assert_eq!(negotiation.active_mechanism(), None);
    }

    #[test]
    fn test_failures_are_counted() {
        let registry = MechanismRegistry::standard(authenticator());
        let mut negotiation = SaslNegotiation::new();

        for attempt in 1..=3 {
            let outcome = negotiation.auth(&registry, "PLAIN", &payload(b"\0alice\0wrong"));
            assert_eq!(failure_condition(&outcome), Some(SaslCondition::NotAuthorized));
            assert_eq!(negotiation.failures(), attempt);
        }
    }

    #[test]
    fn test_static_authenticator() {
        let auth = StaticAuthenticator::new().with_user("alice", "secret");
        assert!(auth.verify_plain("alice", "secret"));
        assert!(!auth.verify_plain("alice", "Secret"));
        assert!(!auth.verify_plain("alice", "secret "));
        assert!(!auth.verify_plain("alice", ""));
        assert!(!auth.verify_plain("bob", "secret"));
        assert!(auth.scram_credentials("alice").is_some());
        assert!(auth.scram_credentials("bob").is_none());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("alice", "secret");
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
