//! Server configuration.
//!
//! Loaded from an optional TOML file, then overridden by `PARLEY__*`
//! environment variables (`PARLEY__STREAM__DOMAIN=example.com`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use parley_xmpp::{StreamConfig, TlsPolicy};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:5222";

/// Certificate and key for STARTTLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM PKCS#8 private key
    pub key_path: Option<PathBuf>,
}

/// An account accepted by the static authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// Everything the daemon needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the client listener
    pub listen: String,
    pub tls: TlsFiles,
    pub stream: StreamConfig,
    pub users: Vec<UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            tls: TlsFiles::default(),
            stream: StreamConfig::default(),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let config = Self::from_builder(builder.add_source(environment()))
            .with_context(|| match path {
                Some(path) => format!("Failed to load configuration from {}", path.display()),
                None => "Failed to load configuration from the environment".to_string(),
            })?;

        match path {
            Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
            None => tracing::info!("No config file given, using defaults and environment"),
        }
        Ok(config)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config: Self = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.stream
            .validate()
            .context("Invalid [stream] configuration")?;

        if self.stream.tls != TlsPolicy::Disabled
            && (self.tls.cert_path.is_none() || self.tls.key_path.is_none())
        {
            bail!(
                "stream.tls is '{}' but tls.cert_path and tls.key_path are not both set",
                match self.stream.tls {
                    TlsPolicy::Required => "required",
                    _ => "optional",
                }
            );
        }

        for user in &self.users {
            if user.username.trim().is_empty() {
                bail!("users entries need a username");
            }
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix("PARLEY").separator("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str, env: &[(&str, &str)]) -> Result<ServerConfig> {
        let env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<config::Map<String, String>>();
        ServerConfig::from_builder(
            Config::builder()
                .add_source(File::from_str(toml, FileFormat::Toml))
                .add_source(environment().source(Some(env))),
        )
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.stream.tls, TlsPolicy::Required);
        // Required TLS without certificates is rejected.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_toml() {
        let config = parse(
            r#"
            listen = "127.0.0.1:5333"

            [tls]
            cert_path = "/etc/parley/cert.pem"
            key_path = "/etc/parley/key.pem"

            [stream]
            domain = "example.com"
            mechanisms = ["PLAIN"]

            [[users]]
            username = "alice"
            password = "secret"
            "#,
            &[],
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:5333");
        assert_eq!(config.stream.domain, "example.com");
        assert_eq!(config.stream.mechanisms, vec!["PLAIN".to_string()]);
        assert_eq!(config.stream.max_auth_attempts, 3);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].username, "alice");
        assert_eq!(
            config.tls.cert_path.as_deref(),
            Some(Path::new("/etc/parley/cert.pem"))
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = parse(
            r#"
            [stream]
            domain = "example.com"
            tls = "disabled"
            "#,
            &[
                ("PARLEY__STREAM__DOMAIN", "chat.example.org"),
                ("PARLEY__LISTEN", "[::1]:5222"),
            ],
        )
        .unwrap();

        assert_eq!(config.stream.domain, "chat.example.org");
        assert_eq!(config.listen, "[::1]:5222");
        assert_eq!(config.stream.tls, TlsPolicy::Disabled);
    }

    #[test]
    fn test_invalid_domain_is_rejected() {
        let err = parse(
            r#"
            [stream]
            domain = ""
            tls = "disabled"
            "#,
            &[],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("domain"));
    }

    #[test]
    fn test_serialized_defaults_load_back() {
        let mut original = ServerConfig::default();
        original.stream.tls = TlsPolicy::Disabled;
        let rendered = toml::to_string(&original).unwrap();

        let loaded = parse(&rendered, &[]).unwrap();
        assert_eq!(loaded.listen, original.listen);
        assert_eq!(loaded.stream.mechanisms, original.stream.mechanisms);
        assert_eq!(loaded.stream.version, original.stream.version);
    }
}
