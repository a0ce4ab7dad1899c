//! Per-generation accept loop.
//!
//! For every accepted connection, in order:
//! 1. reject it unless it opens with a TLS handshake record
//! 2. force the TLS handshake (client certificate required)
//! 3. evaluate the authorization policy against the peer chain
//! 4. hand it to a session task and go back to accepting
//!
//! Steps 1-3 run inline in the loop. The stop signal is checked only after
//! an accept call returns; closing the socket is what makes a blocked accept
//! return.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use super::context::{Admission, ProxyContext};
use super::generation::{InFlight, StopSignal};
use super::handler;
use super::socket::ListenSocket;
use crate::auth::Decision;
use crate::events::{ProxyEvent, RejectReason};
use crate::tls::{CertificateInfo, TLS_HANDSHAKE_RECORD};

/// Lifecycle of an accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    /// Accepting connections.
    Running,
    /// Stop observed, closing the socket.
    Stopping,
    /// Socket closed, loop exited.
    Stopped,
}

pub(crate) struct Acceptor {
    pub(crate) socket: ListenSocket,
    pub(crate) tls: TlsAcceptor,
    pub(crate) ctx: Arc<ProxyContext>,
    pub(crate) stop: StopSignal,
    pub(crate) state: watch::Sender<AcceptorState>,
    pub(crate) in_flight: Arc<InFlight>,
    pub(crate) listen_addr: SocketAddr,
    pub(crate) certificate: CertificateInfo,
}

impl Acceptor {
    /// Accept until a stop signal is observed.
    pub(crate) async fn run(mut self) {
        loop {
            let accepted = self.socket.accept().await;

            if self.stop.is_requested() {
                self.retire();
                return;
            }

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer).await,
                Err(e) => {
                    self.ctx
                        .sink
                        .emit(ProxyEvent::AcceptFailed { error: e.to_string() });
                    // Retry right away, but let other tasks run first.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn retire(self) {
        self.state.send_replace(AcceptorState::Stopping);
        self.ctx.sink.emit(ProxyEvent::GenerationRetired {
            listen_addr: self.listen_addr,
            certificate: self.certificate.clone(),
        });
        drop(self.socket);
        self.state.send_replace(AcceptorState::Stopped);
    }

    /// Take one accepted connection through the checks and dispatch it.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let sink = &self.ctx.sink;

        if !opens_with_tls_record(&stream).await {
            sink.emit(ProxyEvent::NotTls { peer });
            return;
        }

        let tls_stream = match self.tls.accept(stream).await {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                sink.emit(ProxyEvent::HandshakeFailed {
                    peer,
                    error: e.to_string(),
                });
                return;
            }
        };

        let decision = match tls_stream.get_ref().1.peer_certificates() {
            Some(chain) => self.ctx.policy.evaluate(chain),
            None => Decision::Deny,
        };
        if !decision.is_allowed() {
            sink.emit(ProxyEvent::Rejected {
                peer,
                reason: RejectReason::BadClientCertificate,
            });
            return;
        }

        let permit = match self.ctx.admit() {
            Admission::Full => {
                sink.emit(ProxyEvent::Rejected {
                    peer,
                    reason: RejectReason::ConnectionLimit,
                });
                return;
            }
            Admission::Admitted(permit) => Some(permit),
            Admission::Unbounded => None,
        };

        let session = self.in_flight.enter().with_permit(permit);
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(
            async move {
                handler::handle(
                    tls_stream,
                    peer,
                    &ctx.backend,
                    Arc::clone(&ctx.sink),
                    session,
                )
                .await;
            }
            .instrument(tracing::info_span!("connection", peer = %peer)),
        );
    }
}

/// Whether the first byte the peer sent starts a TLS handshake record.
///
/// Waits for the first byte without consuming it. A peer that closes before
/// sending anything is not TLS.
async fn opens_with_tls_record(stream: &TcpStream) -> bool {
    let mut first = [0u8; 1];
    matches!(stream.peek(&mut first).await, Ok(1) if first[0] == TLS_HANDSHAKE_RECORD)
}
