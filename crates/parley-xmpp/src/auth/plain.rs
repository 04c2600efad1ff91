//! SASL PLAIN (RFC 4616).
//!
//! Message format: `authzid \0 authcid \0 password`. Only meant for use over
//! an encrypted channel.

use std::sync::Arc;

use super::{Authenticator, ClientMechanism, Credentials, ServerMechanism, ServerStep};
use crate::error::SaslCondition;
use crate::packet::{Packet, SaslAuth, SaslPayload};
use crate::XmppError;

pub const MECHANISM: &str = "PLAIN";

/// Parsed PLAIN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMessage {
    pub authzid: Option<String>,
    pub authcid: String,
    pub password: String,
}

/// Split a PLAIN message into its three fields.
pub fn parse_plain(data: &[u8]) -> Result<PlainMessage, SaslCondition> {
    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    let &[authzid, authcid, password] = parts.as_slice() else {
        return Err(SaslCondition::MalformedRequest);
    };

    let field = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| SaslCondition::MalformedRequest)
    };

    let authzid = field(authzid)?;
    let authcid = field(authcid)?;
    if authcid.is_empty() {
        return Err(SaslCondition::MalformedRequest);
    }

    Ok(PlainMessage {
        authzid: (!authzid.is_empty()).then_some(authzid),
        authcid,
        password: field(password)?,
    })
}

/// Server side of PLAIN.
pub struct PlainServer {
    authenticator: Arc<dyn Authenticator>,
}

impl PlainServer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    fn verify(&self, data: &[u8]) -> ServerStep {
        let message = match parse_plain(data) {
            Ok(message) => message,
            Err(condition) => return ServerStep::failure(condition, "invalid PLAIN message"),
        };

        if let Some(authzid) = &message.authzid {
            // Acting on behalf of someone else is not supported.
            let own = authzid == &message.authcid
                || authzid
                    .split_once('@')
                    .is_some_and(|(local, _)| local == message.authcid);
            if !own {
                return ServerStep::failure(SaslCondition::InvalidAuthzid, "authzid not permitted");
            }
        }

        if !self
            .authenticator
            .verify_plain(&message.authcid, &message.password)
        {
            return ServerStep::failure(SaslCondition::NotAuthorized, "bad credentials");
        }

        ServerStep::success(message.authcid, &[])
    }
}

impl ServerMechanism for PlainServer {
    fn auth(&mut self, initial: &[u8]) -> ServerStep {
        if initial.is_empty() {
            return ServerStep::challenge(&[]);
        }
        self.verify(initial)
    }

    fn response(&mut self, data: &[u8]) -> ServerStep {
        self.verify(data)
    }
}

/// Client side of PLAIN.
pub struct PlainClient {
    credentials: Credentials,
}

impl PlainClient {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        if let Some(authzid) = &self.credentials.authzid {
            message.extend_from_slice(authzid.as_bytes());
        }
        message.push(0);
        message.extend_from_slice(self.credentials.username.as_bytes());
        message.push(0);
        message.extend_from_slice(self.credentials.password.as_bytes());
        message
    }
}

impl ClientMechanism for PlainClient {
    fn begin(&mut self) -> Result<Packet, XmppError> {
        Ok(Packet::SaslAuth(SaslAuth {
            mechanism: MECHANISM.to_string(),
            payload: SaslPayload::from_bytes(&self.message()),
        }))
    }

    fn challenge(&mut self, data: &[u8]) -> Result<Packet, XmppError> {
        // The only challenge PLAIN knows is the empty one asking for the message.
        if !data.is_empty() {
            return Err(XmppError::protocol("unexpected PLAIN challenge"));
        }
        Ok(Packet::SaslResponse(SaslPayload::from_bytes(&self.message())))
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), XmppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;

    fn server() -> PlainServer {
        PlainServer::new(Arc::new(
            StaticAuthenticator::new().with_user("alice", "secret"),
        ))
    }

    fn failure(step: &ServerStep) -> Option<SaslCondition> {
        match &step.reply {
            Packet::SaslFailure(failure) => failure.condition,
            _ => None,
        }
    }

    #[test]
    fn test_parse_plain() {
        let message = parse_plain(b"\0alice\0secret").unwrap();
        assert_eq!(message.authzid, None);
        assert_eq!(message.authcid, "alice");
        assert_eq!(message.password, "secret");

        let message = parse_plain(b"alice@example.com\0alice\0secret").unwrap();
        assert_eq!(message.authzid.as_deref(), Some("alice@example.com"));

        // An empty password is still three fields.
        assert_eq!(parse_plain(b"\0alice\0").unwrap().password, "");
    }

    #[test]
    fn test_parse_plain_requires_three_fields() {
        assert_eq!(parse_plain(b"alice\0secret"), Err(SaslCondition::MalformedRequest));
        assert_eq!(parse_plain(b"\0a\0b\0c"), Err(SaslCondition::MalformedRequest));
        assert_eq!(parse_plain(b"\0\0secret"), Err(SaslCondition::MalformedRequest));
        assert_eq!(
            parse_plain(b"\0\xff\xfe\0secret"),
            Err(SaslCondition::MalformedRequest)
        );
    }

    #[test]
    fn test_server_accepts_valid_credentials() {
        let step = server().auth(b"\0alice\0secret");
        assert_eq!(step.identity.as_deref(), Some("alice"));
        assert!(step.error.is_none());
        assert!(matches!(step.reply, Packet::SaslSuccess(_)));
    }

    #[test]
    fn test_server_rejects_bad_password() {
        let step = server().auth(b"\0alice\0nope");
        assert!(step.identity.is_none());
        assert!(step.error.is_some());
        assert_eq!(failure(&step), Some(SaslCondition::NotAuthorized));
    }

    #[test]
    fn test_server_rejects_foreign_authzid() {
        let step = server().auth(b"bob@example.com\0alice\0secret");
        assert_eq!(failure(&step), Some(SaslCondition::InvalidAuthzid));

        let step = server().auth(b"alice@example.com\0alice\0secret");
        assert_eq!(step.identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_client_messages() {
        let mut client = PlainClient::new(Credentials::new("alice", "secret"));
        let Packet::SaslAuth(auth) = client.begin().unwrap() else {
            panic!("expected auth");
        };
        assert_eq!(auth.mechanism, "PLAIN");
        assert_eq!(auth.payload.data.as_deref(), Some("AGFsaWNlAHNlY3JldA=="));

        assert!(matches!(client.challenge(b"").unwrap(), Packet::SaslResponse(_)));
        assert!(client.challenge(b"junk").is_err());
    }
}
