//! Lifecycle events and the sink that receives them.
//!
//! Every component gets an `Arc<dyn EventSink>` handed to it instead of
//! logging through a global. The binary plugs in [`TracingSink`]; tests plug
//! in a recorder and assert on what happened to each connection.

use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::tls::CertificateInfo;

/// Why an accepted TLS connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The authorization policy denied the peer certificate chain.
    BadClientCertificate,
    /// The admission gate had no free slot.
    ConnectionLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadClientCertificate => f.write_str("bad client certificate"),
            RejectReason::ConnectionLimit => f.write_str("connection limit reached"),
        }
    }
}

/// A lifecycle event emitted by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A listener generation started accepting.
    GenerationStarted {
        listen_addr: SocketAddr,
        certificate: CertificateInfo,
    },
    /// The accept call failed.
    AcceptFailed { error: String },
    /// Accepted connection did not speak TLS.
    NotTls { peer: SocketAddr },
    /// TLS handshake failed.
    HandshakeFailed { peer: SocketAddr, error: String },
    /// Connection rejected after the handshake.
    Rejected {
        peer: SocketAddr,
        reason: RejectReason,
    },
    /// Authorized connection handed to a session task.
    Incoming { peer: SocketAddr },
    /// Backend could not be dialed.
    DialFailed {
        peer: SocketAddr,
        backend: String,
        error: String,
    },
    /// A directional copy is starting.
    PipeOpened { dst: SocketAddr, src: SocketAddr },
    /// A directional copy hit an I/O error.
    PipeFailed {
        dst: SocketAddr,
        src: SocketAddr,
        error: String,
    },
    /// A directional copy ended.
    PipeClosed {
        dst: SocketAddr,
        src: SocketAddr,
        bytes: u64,
    },
    /// A listener generation observed its stop signal and closed its socket.
    GenerationRetired {
        listen_addr: SocketAddr,
        certificate: CertificateInfo,
    },
    /// All sessions of a retired generation finished.
    GenerationDrained { certificate: CertificateInfo },
    /// Certificate files were reloaded.
    CertificateReloaded {
        certificate: CertificateInfo,
        rotated: bool,
    },
    /// Certificate reload failed; the current generation keeps serving.
    CertificateReloadFailed { error: String },
}

/// Receiver of proxy lifecycle events.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn emit(&self, event: ProxyEvent);
}

/// Event sink that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProxyEvent) {
        match event {
            ProxyEvent::GenerationStarted {
                listen_addr,
                certificate,
            } => info!(
                listen_addr = %listen_addr,
                serial = %certificate.serial,
                not_after = %certificate.not_after,
                "Listening with certificate"
            ),
            ProxyEvent::AcceptFailed { error } => {
                warn!(error = %error, "Error accepting connection")
            }
            ProxyEvent::NotTls { peer } => {
                warn!(peer_addr = %peer, "Received non-TLS connection, ignoring")
            }
            ProxyEvent::HandshakeFailed { peer, error } => {
                warn!(peer_addr = %peer, error = %error, "Failed TLS handshake")
            }
            ProxyEvent::Rejected { peer, reason } => {
                warn!(peer_addr = %peer, reason = %reason, "Rejecting connection")
            }
            ProxyEvent::Incoming { peer } => info!(peer_addr = %peer, "Incoming connection"),
            ProxyEvent::DialFailed {
                peer,
                backend,
                error,
            } => warn!(
                peer_addr = %peer,
                backend = %backend,
                error = %error,
                "Failed to dial backend"
            ),
            ProxyEvent::PipeOpened { dst, src } => {
                debug!(dst = %dst, src = %src, "Opening pipe")
            }
            ProxyEvent::PipeFailed { dst, src, error } => {
                debug!(dst = %dst, src = %src, error = %error, "Pipe error")
            }
            ProxyEvent::PipeClosed { dst, src, bytes } => {
                debug!(dst = %dst, src = %src, bytes, "Closed pipe")
            }
            ProxyEvent::GenerationRetired {
                listen_addr,
                certificate,
            } => info!(
                listen_addr = %listen_addr,
                serial = %certificate.serial,
                not_after = %certificate.not_after,
                "Closing socket"
            ),
            ProxyEvent::GenerationDrained { certificate } => info!(
                serial = %certificate.serial,
                "All connections drained"
            ),
            ProxyEvent::CertificateReloaded {
                certificate,
                rotated,
            } => info!(
                serial = %certificate.serial,
                not_after = %certificate.not_after,
                rotated,
                "Certificate reloaded"
            ),
            ProxyEvent::CertificateReloadFailed { error } => {
                warn!(error = %error, "Certificate reload failed, keeping current listener")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_text() {
        assert_eq!(
            RejectReason::BadClientCertificate.to_string(),
            "bad client certificate"
        );
        assert_eq!(
            RejectReason::ConnectionLimit.to_string(),
            "connection limit reached"
        );
    }
}
