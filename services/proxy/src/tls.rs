//! Server identity and mTLS configuration.
//!
//! A listener generation is bound to one [`ServerIdentity`]: the certificate
//! chain and key it presents, plus the leaf's serial number and expiry which
//! identify the generation in logs. Clients must present a certificate that
//! chains to the configured CA bundle; whether a verified client may proceed
//! is decided afterwards by the authorization policy.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::*;

use crate::error::{Error, Result};

/// Content type byte of a TLS handshake record.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Identity of a server certificate, used to label a listener generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Serial number in decimal.
    pub serial: String,
    /// End of the validity period.
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Parse the identity out of a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {:?}", e)))?;

        let expiry = cert.validity().not_after.timestamp();
        let not_after = DateTime::<Utc>::from_timestamp(expiry, 0).ok_or_else(|| {
            Error::Certificate(format!("certificate expiry out of range: {}", expiry))
        })?;

        Ok(Self {
            serial: cert.tbs_certificate.serial.to_string(),
            not_after,
        })
    }
}

impl fmt::Display for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "serial no. {} (expiring {})",
            self.serial,
            self.not_after.to_rfc3339()
        )
    }
}

/// Certificate chain and private key served by a listener generation.
pub struct ServerIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    info: CertificateInfo,
}

impl ServerIdentity {
    /// Build an identity from DER material. The first certificate is the leaf.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("certificate chain is empty".to_string()))?;
        let info = CertificateInfo::from_der(leaf.as_ref())?;
        Ok(Self { chain, key, info })
    }

    /// Load an identity from a PEM certificate chain and a PEM private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let chain = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Self::from_der(chain, key)
    }

    /// Identity of the leaf certificate.
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Build the TLS acceptor for this identity.
    ///
    /// The acceptor requires a client certificate that chains to
    /// `client_roots`.
    pub fn acceptor(&self, client_roots: Arc<RootCertStore>) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let verifier = WebPkiClientVerifier::builder_with_provider(client_roots, provider.clone())
            .build()
            .map_err(|e| Error::Tls(format!("client verifier error: {}", e)))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("chain_len", &self.chain.len())
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Build the trust store used to verify client certificates.
pub fn client_roots(certs: Vec<CertificateDer<'static>>) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::Certificate(format!("failed to add CA certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(Error::Certificate("CA bundle is empty".to_string()));
    }
    Ok(Arc::new(roots))
}

/// Load the client CA bundle from a PEM file.
pub fn load_client_roots(path: &Path) -> Result<Arc<RootCertStore>> {
    client_roots(load_certs(path)?)
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Certificate(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Certificate(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Certificate(format!("{}: no private key found", path.display())))
}

fn open(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| Error::Certificate(format!("failed to open {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair, SerialNumber};
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn self_signed(
        serial: u64,
    ) -> (CertificateDer<'static>, PrivateKeyDer<'static>, String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.serial_number = Some(SerialNumber::from(serial));
        let cert = params.self_signed(&key).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (der, key_der, cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_certificate_info_serial() {
        let (der, _, _, _) = self_signed(42);
        let info = CertificateInfo::from_der(der.as_ref()).unwrap();
        assert_eq!(info.serial, "42");
        assert!(info.not_after > Utc::now());
    }

    #[test]
    fn test_certificate_info_rejects_garbage() {
        let result = CertificateInfo::from_der(b"not a certificate");
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn test_identity_from_empty_chain() {
        let (_, key, _, _) = self_signed(1);
        let result = ServerIdentity::from_der(Vec::new(), key);
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn test_identity_load_pem() {
        let dir = tempfile::tempdir().unwrap();
        let (der, _, cert_pem, key_pem) = self_signed(7);
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let identity = ServerIdentity::load(&cert_path, &key_path).unwrap();
        assert_eq!(identity.info().serial, "7");

        let roots = client_roots(vec![der]).unwrap();
        assert!(identity.acceptor(roots).is_ok());
    }

    #[test]
    fn test_identity_load_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, cert_pem, _) = self_signed(7);
        let cert_path = dir.path().join("server.pem");
        std::fs::write(&cert_path, &cert_pem).unwrap();

        let result = ServerIdentity::load(&cert_path, &cert_path);
        assert!(matches!(result, Err(Error::Certificate(msg)) if msg.contains("no private key")));
    }

    #[test]
    fn test_empty_ca_bundle() {
        assert!(client_roots(Vec::new()).is_err());
    }
}
