//! Error types for the proxy.
//!
//! Only setup paths (certificate loading, TLS setup, binding) return
//! these. Per-connection failures are reported through the event sink and
//! never surface as errors.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy setup errors.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not bind the listen socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Certificate or key material is missing or malformed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result alias for proxy setup operations.
pub type Result<T> = std::result::Result<T, Error>;
