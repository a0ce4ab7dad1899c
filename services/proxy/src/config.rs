//! Proxy configuration.
//!
//! Everything is read from `CERTGATE_*` environment variables.

use std::net::SocketAddr;
use std::sync::Arc;
use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use certgate_networking::BackendEndpoint;

use crate::auth::{AllowAll, AllowList, AuthorizationPolicy};
use crate::rotation::CertificatePaths;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub listen_addr: SocketAddr,

    /// Backend `host:port`, resolved once by [`Config::resolve_backend`].
    pub target: String,

    /// Server certificate chain and key PEM files.
    pub certificate: CertificatePaths,

    /// CA bundle used to verify client certificates.
    pub ca_cert: PathBuf,

    /// Who may connect once the client certificate verifies.
    pub allow: Allow,

    /// Upper bound on concurrently running sessions.
    pub max_connections: Option<usize>,

    /// Reload the certificate files this often.
    pub reload_interval: Option<Duration>,

    /// How long to wait for sessions to finish on shutdown.
    pub shutdown_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Authorization rule applied after the TLS handshake.
#[derive(Debug, Clone)]
pub enum Allow {
    /// Any client whose certificate chains to the CA bundle.
    All,
    /// Clients matching at least one listed identity.
    List(AllowList),
}

impl Allow {
    pub fn policy(&self) -> Arc<dyn AuthorizationPolicy> {
        match self {
            Allow::All => Arc::new(AllowAll),
            Allow::List(list) => Arc::new(list.clone()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| var(key).with_context(|| format!("Missing {key}."));

        let listen_addr: SocketAddr = required("CERTGATE_LISTEN")?
            .trim()
            .parse()
            .context("CERTGATE_LISTEN must be an ip:port socket address.")?;

        let target = required("CERTGATE_TARGET")?.trim().to_string();

        let certificate = CertificatePaths {
            cert: required("CERTGATE_CERT")?.into(),
            key: required("CERTGATE_KEY")?.into(),
        };
        let ca_cert: PathBuf = required("CERTGATE_CACERT")?.into();

        let allow_all = var("CERTGATE_ALLOW_ALL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut list = AllowList::new();
        for cn in split_list(var("CERTGATE_ALLOW_CN")) {
            list = list.common_name(cn);
        }
        for ou in split_list(var("CERTGATE_ALLOW_OU")) {
            list = list.organizational_unit(ou);
        }
        for dns in split_list(var("CERTGATE_ALLOW_DNS")) {
            list = list.dns_name(dns);
        }
        for uri in split_list(var("CERTGATE_ALLOW_URI")) {
            list = list.uri(uri);
        }

        let allow = match (allow_all, list.is_empty()) {
            (true, true) => Allow::All,
            (false, false) => Allow::List(list),
            (true, false) => {
                bail!("CERTGATE_ALLOW_ALL cannot be combined with CERTGATE_ALLOW_* lists.")
            }
            (false, true) => bail!(
                "No clients allowed. Set CERTGATE_ALLOW_ALL or at least one of \
                 CERTGATE_ALLOW_CN, CERTGATE_ALLOW_OU, CERTGATE_ALLOW_DNS, CERTGATE_ALLOW_URI."
            ),
        };

        let max_connections: Option<usize> = var("CERTGATE_MAX_CONNECTIONS")
            .map(|v| v.trim().parse())
            .transpose()
            .context("CERTGATE_MAX_CONNECTIONS must be an integer.")?;
        if max_connections == Some(0) {
            bail!("CERTGATE_MAX_CONNECTIONS must be greater than zero.");
        }

        let reload_interval = var("CERTGATE_RELOAD_INTERVAL_SECS")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .context("CERTGATE_RELOAD_INTERVAL_SECS must be an integer (seconds).")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let shutdown_timeout_secs: u64 = var("CERTGATE_SHUTDOWN_TIMEOUT_SECS")
            .map(|v| v.trim().parse())
            .transpose()
            .context("CERTGATE_SHUTDOWN_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let log_level = var("CERTGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            target,
            certificate,
            ca_cert,
            allow,
            max_connections,
            reload_interval,
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            log_level,
        })
    }

    /// Resolve the backend once. The first resolved address wins.
    pub async fn resolve_backend(&self) -> Result<BackendEndpoint> {
        let addr = tokio::net::lookup_host(self.target.as_str())
            .await
            .with_context(|| format!("Failed to resolve backend {}", self.target))?
            .next()
            .with_context(|| format!("Backend {} resolved to no addresses", self.target))?;
        Ok(BackendEndpoint::new(addr))
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
