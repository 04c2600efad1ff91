//! STARTTLS upgrade providers.
//!
//! The engine only knows the [`SecureChannel`] seam; the rustls-backed
//! implementations live here.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::stream::BoxedIo;
use crate::XmppError;

/// Wraps a plain transport in TLS after `<proceed/>`.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Run the handshake over `io` and hand back the encrypted stream.
    async fn upgrade(&self, io: BoxedIo) -> Result<BoxedIo, XmppError>;
}

/// Server side of the handshake.
#[derive(Clone)]
pub struct RustlsAcceptor {
    acceptor: TlsAcceptor,
}

impl RustlsAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Load a certificate chain and PKCS#8 key from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, XmppError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_file = File::open(cert_path).map_err(|e| {
            XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
        })?;
        let key_file = File::open(key_path).map_err(|e| {
            XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
        })?;

        let config = server_config(
            &mut BufReader::new(cert_file),
            &mut BufReader::new(key_file),
        )?;
        Ok(Self::new(config))
    }

    /// Build from in-memory PEM data.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, XmppError> {
        let config = server_config(&mut &cert_pem[..], &mut &key_pem[..])?;
        Ok(Self::new(config))
    }
}

fn server_config(
    certs: &mut dyn std::io::BufRead,
    key: &mut dyn std::io::BufRead,
) -> Result<Arc<ServerConfig>, XmppError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(certs)
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config("No certificate found"));
    }

    let key = rustls_pemfile::pkcs8_private_keys(key)
        .filter_map(|r| r.ok())
        .next()
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
    .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

    Ok(Arc::new(config))
}

#[async_trait]
impl SecureChannel for RustlsAcceptor {
    async fn upgrade(&self, io: BoxedIo) -> Result<BoxedIo, XmppError> {
        let tls = self.acceptor.accept(io).await?;
        debug!("TLS handshake complete");
        Ok(Box::new(tls))
    }
}

/// Client side of the handshake, verifying the server as `domain`.
#[derive(Clone)]
pub struct RustlsConnector {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl RustlsConnector {
    pub fn new(config: Arc<ClientConfig>, domain: &str) -> Result<Self, XmppError> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| XmppError::config(format!("Invalid TLS server name '{domain}': {e}")))?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    /// Trust only the PEM certificates in `ca_pem`.
    pub fn with_trusted_pem(ca_pem: &[u8], domain: &str) -> Result<Self, XmppError> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let cert = cert.map_err(|e| XmppError::config(format!("Invalid CA certificate: {e}")))?;
            roots.add(cert)?;
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Self::new(Arc::new(config), domain)
    }
}

#[async_trait]
impl SecureChannel for RustlsConnector {
    async fn upgrade(&self, io: BoxedIo) -> Result<BoxedIo, XmppError> {
        let tls = self.connector.connect(self.server_name.clone(), io).await?;
        debug!("TLS handshake complete");
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_missing_files() {
        assert!(matches!(
            RustlsAcceptor::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem"),
            Err(XmppError::Config(_))
        ));
    }

    #[test]
    fn test_empty_pem() {
        assert!(RustlsAcceptor::from_pem(b"", b"").is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let certified = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();

        let acceptor = RustlsAcceptor::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let connector = RustlsConnector::with_trusted_pem(cert_pem.as_bytes(), "example.com").unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut tls = acceptor.upgrade(Box::new(server_io)).await.unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut tls = connector.upgrade(Box::new(client_io)).await.unwrap();
        tls.write_all(b"hello").await.unwrap();
        tls.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }
}
