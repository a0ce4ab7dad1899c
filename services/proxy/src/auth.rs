//! Client authorization.
//!
//! The TLS layer only proves that a client certificate chains to a trusted
//! CA. Whether that client may reach the backend is decided here, once per
//! connection, after the handshake and before the backend is dialed.

use std::collections::HashSet;

use rustls::pki_types::CertificateDer;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Outcome of evaluating a peer certificate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Decides whether a verified peer certificate chain may proceed.
///
/// `chain[0]` is the client's leaf certificate.
pub trait AuthorizationPolicy: Send + Sync {
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> Decision;
}

impl<F> AuthorizationPolicy for F
where
    F: Fn(&[CertificateDer<'_>]) -> Decision + Send + Sync,
{
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> Decision {
        self(chain)
    }
}

/// Allows every client whose certificate passed TLS verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> Decision {
        Decision::from(!chain.is_empty())
    }
}

/// Allows clients whose leaf certificate matches any listed identity.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    common_names: HashSet<String>,
    organizational_units: HashSet<String>,
    dns_names: HashSet<String>,
    uris: HashSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a subject common name.
    pub fn common_name(mut self, cn: impl Into<String>) -> Self {
        self.common_names.insert(cn.into());
        self
    }

    /// Allow a subject organizational unit.
    pub fn organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_units.insert(ou.into());
        self
    }

    /// Allow a DNS subject alternative name.
    pub fn dns_name(mut self, name: impl Into<String>) -> Self {
        self.dns_names.insert(name.into());
        self
    }

    /// Allow a URI subject alternative name.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.insert(uri.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.common_names.is_empty()
            && self.organizational_units.is_empty()
            && self.dns_names.is_empty()
            && self.uris.is_empty()
    }

    fn matches(&self, cert: &X509Certificate<'_>) -> bool {
        let subject = cert.subject();

        if subject
            .iter_common_name()
            .filter_map(|attr| attr.as_str().ok())
            .any(|cn| self.common_names.contains(cn))
        {
            return true;
        }

        if subject
            .iter_organizational_unit()
            .filter_map(|attr| attr.as_str().ok())
            .any(|ou| self.organizational_units.contains(ou))
        {
            return true;
        }

        let Ok(Some(san)) = cert.subject_alternative_name() else {
            return false;
        };
        san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(dns) => self.dns_names.contains(*dns),
            GeneralName::URI(uri) => self.uris.contains(*uri),
            _ => false,
        })
    }
}

impl AuthorizationPolicy for AllowList {
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> Decision {
        let Some(leaf) = chain.first() else {
            return Decision::Deny;
        };

        match X509Certificate::from_der(leaf.as_ref()) {
            Ok((_, cert)) => Decision::from(self.matches(&cert)),
            Err(e) => {
                debug!(error = ?e, "Unparseable client certificate");
                Decision::Deny
            }
        }
    }
}
