use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_xmpp::{RustlsAcceptor, ServerContext, StaticAuthenticator, TlsPolicy, XmppServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod telemetry;

use config::ServerConfig;
use telemetry::LogFormat;

/// Parley XMPP server.
#[derive(Debug, Parser)]
#[command(name = "parley-server", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("Parley server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let mut users = StaticAuthenticator::new();
    for user in &config.users {
        users.add_user(user.username.as_str(), user.password.as_str());
    }
    if users.is_empty() {
        warn!("No users configured; every authentication attempt will fail");
    }

    let mut builder = ServerContext::builder(config.stream.clone()).authenticator(Arc::new(users));
    if config.stream.tls != TlsPolicy::Disabled {
        if let (Some(cert), Some(key)) = (&config.tls.cert_path, &config.tls.key_path) {
            let acceptor = RustlsAcceptor::from_pem_files(cert, key)
                .context("Failed to load TLS certificate")?;
            builder = builder.secure_channel(Arc::new(acceptor));
        }
    }
    let context = builder.build().context("Failed to set up the XMPP engine")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        }
    });

    XmppServer::new(context)
        .run(listener, shutdown)
        .await
        .context("XMPP server failed")?;

    info!("Parley server stopped");
    Ok(())
}
