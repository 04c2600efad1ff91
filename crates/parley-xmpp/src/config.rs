//! Stream negotiation settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{StreamRole, StreamVersion, TlsPolicy, UnknownElementPolicy};
use crate::XmppError;

/// Settings shared by every session accepted with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Domain this server answers for (`to` of incoming headers, `from` of ours)
    pub domain: String,
    /// Kind of peer expected on accepted streams
    pub role: StreamRole,
    /// Highest stream version supported
    pub version: StreamVersion,
    /// STARTTLS policy
    pub tls: TlsPolicy,
    /// SASL mechanisms offered, in order of preference
    pub mechanisms: Vec<String>,
    /// Idle time after which a whitespace keepalive is sent; 0 disables
    pub idle_timeout_secs: u64,
    /// Handling of unknown top-level elements
    pub unknown_elements: UnknownElementPolicy,
    /// Failed SASL attempts tolerated before the stream is closed
    pub max_auth_attempts: u32,
    /// Value of `xml:lang` on our stream header
    pub lang: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            role: StreamRole::Client,
            version: StreamVersion::V1_0,
            tls: TlsPolicy::Required,
            mechanisms: vec!["SCRAM-SHA-256".to_string(), "PLAIN".to_string()],
            idle_timeout_secs: 600,
            unknown_elements: UnknownElementPolicy::Passthrough,
            max_auth_attempts: 3,
            lang: "en".to_string(),
        }
    }
}

impl StreamConfig {
    /// Defaults for `domain`.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// The keepalive interval, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Reject settings no session could run with.
    pub fn validate(&self) -> Result<(), XmppError> {
        if self.domain.trim().is_empty() {
            return Err(XmppError::config("domain must not be empty"));
        }
        jid::BareJid::new(&self.domain)
            .map_err(|e| XmppError::config(format!("domain '{}' is invalid: {e}", self.domain)))?;
        if self.mechanisms.is_empty() {
            return Err(XmppError::config("at least one SASL mechanism must be enabled"));
        }
        if self.max_auth_attempts == 0 {
            return Err(XmppError::config("max_auth_attempts must be at least 1"));
        }
        if self.version < StreamVersion::V1_0 {
            return Err(XmppError::config(format!(
                "stream version {} is older than 1.0",
                self.version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.version, StreamVersion::V1_0);
        assert_eq!(config.tls, TlsPolicy::Required);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: StreamConfig = toml::from_str(
            r#"
            domain = "example.com"
            role = "server"
            version = "1.0"
            tls = "optional"
            mechanisms = ["PLAIN"]
            idle_timeout_secs = 0
            unknown_elements = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "example.com");
        assert_eq!(config.role, StreamRole::Server);
        assert_eq!(config.tls, TlsPolicy::Optional);
        assert_eq!(config.mechanisms, vec!["PLAIN".to_string()]);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.unknown_elements, UnknownElementPolicy::Reject);
        // Unset fields keep their defaults.
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.lang, "en");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(StreamConfig::for_domain("").validate().is_err());
        assert!(StreamConfig::for_domain("bad domain@").validate().is_err());

        let mut config = StreamConfig::for_domain("example.com");
        config.mechanisms.clear();
        assert!(config.validate().is_err());

        let mut config = StreamConfig::for_domain("example.com");
        config.max_auth_attempts = 0;
        assert!(config.validate().is_err());
    }
}
