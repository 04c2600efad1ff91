//! Core types for stream sessions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::parser::ns;
use crate::XmppError;

/// Negotiation milestones of one stream session.
///
/// Flags only ever go from `false` to `true`, except `started`, which is
/// cleared whenever the stream restarts (after TLS, after SASL). `closed` is
/// terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Both stream headers have been exchanged on the current stream
    pub started: bool,
    /// The transport has been upgraded to TLS
    pub secure: bool,
    /// SASL negotiation succeeded
    pub authenticated: bool,
    /// The session is finished
    pub closed: bool,
}

impl SessionState {
    /// Forget the current stream; the peer must send a fresh header.
    pub fn restart(&mut self) {
        self.started = false;
    }
}

/// Which kind of peer the stream is negotiated with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamRole {
    /// Client-to-server stream (`jabber:client`)
    #[default]
    Client,
    /// Server-to-server stream (`jabber:server`)
    Server,
}

impl StreamRole {
    /// The default content namespace of the stream.
    pub fn content_namespace(&self) -> &'static str {
        match self {
            Self::Client => ns::JABBER_CLIENT,
            Self::Server => ns::JABBER_SERVER,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "c2s"),
            Self::Server => write!(f, "s2s"),
        }
    }
}

/// Protocol version carried in the stream header's `version` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamVersion {
    pub major: u16,
    pub minor: u16,
}

impl StreamVersion {
    /// RFC 6120 streams.
    pub const V1_0: StreamVersion = StreamVersion { major: 1, minor: 0 };

    /// Implied by a header without a `version` attribute.
    pub const LEGACY: StreamVersion = StreamVersion { major: 0, minor: 9 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Default for StreamVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

impl FromStr for StreamVersion {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || XmppError::protocol(format!("invalid stream version '{s}'"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for StreamVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Whether STARTTLS is offered and whether it is mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Never offer STARTTLS
    Disabled,
    /// Offer STARTTLS alongside SASL mechanisms
    Optional,
    /// Offer only STARTTLS until the channel is encrypted
    #[default]
    Required,
}

/// What to do with a top-level element the registry does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownElementPolicy {
    /// Hand it to the dispatcher as an unrecognized event
    #[default]
    Passthrough,
    /// Close the stream with `unsupported-stanza-type`
    Reject,
}

/// IQ `type` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    /// Requests must be answered with a result or an error.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }
}

impl FromStr for IqType {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(XmppError::protocol(format!("invalid iq type '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_order() {
        let v: StreamVersion = "1.0".parse().unwrap();
        assert_eq!(v, StreamVersion::V1_0);
        assert!("2.0".parse::<StreamVersion>().unwrap() > StreamVersion::V1_0);
        assert!("1.10".parse::<StreamVersion>().unwrap() > "1.9".parse().unwrap());
        assert!(StreamVersion::LEGACY < StreamVersion::V1_0);
        assert!("one".parse::<StreamVersion>().is_err());
        assert!("1".parse::<StreamVersion>().is_err());
        assert_eq!(StreamVersion::new(1, 1).to_string(), "1.1");
    }

    #[test]
    fn test_restart_only_clears_started() {
        let mut state = SessionState {
            started: true,
            secure: true,
            authenticated: true,
            closed: false,
        };
        state.restart();
        assert!(!state.started);
        assert!(state.secure);
        assert!(state.authenticated);
    }

    #[test]
    fn test_role_namespaces() {
        assert_eq!(StreamRole::Client.content_namespace(), "jabber:client");
        assert_eq!(StreamRole::Server.content_namespace(), "jabber:server");
    }
}
