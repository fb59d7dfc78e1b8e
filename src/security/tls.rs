//! TLS configuration
//!
//! Server side loads PEM certificate and key files into a rustls config
//! (TLS 1.2+, AEAD suites via the safe defaults). Client side builds on
//! the Mozilla root set, with an explicit opt-in for self-signed peers.

use crate::error::{MailError, Result};
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Server-side TLS material, shared across sessions.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    server_config: Arc<ServerConfig>,
}

impl TlsSettings {
    /// Load certificate chain and PKCS#8 private key from PEM files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("cannot open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("cannot read certificates: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(MailError::Tls("no certificates in file".to_string()));
        }
        debug!("loaded {} certificate(s)", cert_chain.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("cannot open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("cannot read private keys: {}", e)))?;
        if keys.is_empty() {
            return Err(MailError::Tls("no private key in file".to_string()));
        }
        let key = rustls::PrivateKey(keys.remove(0));

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                cert_chain.into_iter().map(rustls::Certificate).collect(),
                key,
            )
            .map_err(|e| MailError::Tls(format!("invalid certificate/key: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Acceptor for implicit-TLS listeners and STARTTLS upgrades.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

/// Client-side connector.
///
/// `accept_invalid_certs` disables verification entirely, for deployments
/// running on self-signed certificates; it must be requested explicitly.
pub fn client_connector(accept_invalid_certs: bool) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if accept_invalid_certs {
        warn!("TLS certificate verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }

    TlsConnector::from(Arc::new(config))
}

/// Verifier that accepts any certificate. Self-signed opt-in only.
struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
