//! Mutual-TLS contexts for the tunnel
//!
//! Both sides present a certificate and verify the peer against the same
//! trust root. By default the own certificate doubles as the root, which
//! suits a pair of hosts sharing one self-issued certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl TlsSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cert_path: config.cert_pem.clone(),
            key_path: config.key_pem.clone(),
            ca_path: config.ca_path().to_path_buf(),
        }
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_root_certificates(self.roots()?)
            .with_client_auth_cert(load_certs(&self.cert_path)?, load_key(&self.key_path)?)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let provider = provider();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(self.roots()?), provider.clone())
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(load_certs(&self.cert_path)?, load_key(&self.key_path)?)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(load_certs(&self.ca_path)?);
        debug!("Loaded {} trust roots ({} ignored) from {}", added, ignored, self.ca_path.display());
        if added == 0 {
            return Err(Error::Tls(format!(
                "no usable CA certificate in {}",
                self.ca_path.display()
            )));
        }
        Ok(roots)
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Dial `addr` and complete the TLS handshake, checking the server
/// certificate against `server_name`
pub async fn dial(connector: &TlsConnector, addr: &str, server_name: &str) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| Error::Dial {
        addr: addr.to_string(),
        reason: format!("invalid server name '{}': {}", server_name, e),
    })?;
    let stream = TcpStream::connect(addr).await.map_err(|e| Error::Dial {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    stream.set_nodelay(true)?;
    connector.connect(name, stream).await.map_err(|e| Error::Dial {
        addr: addr.to_string(),
        reason: format!("TLS handshake failed: {}", e),
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("can't open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificate {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("can't open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse private key {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}
