//! Turns one authorized client connection into a proxied session.

use std::net::SocketAddr;
use std::sync::Arc;

use certgate_networking::BackendEndpoint;
use tokio::io::{AsyncRead, AsyncWrite};

use super::fuse::{fuse, FuseStats};
use super::generation::SessionGuard;
use super::socket::dial;
use crate::events::{EventSink, ProxyEvent};

/// Dial the backend and fuse it with `client`.
///
/// A failed dial ends the session: the client is closed and nothing is
/// retried. Both connections are closed when this returns, and dropping
/// `_session` (also on unwind) tells the generation the session is over.
pub async fn handle<C>(
    client: C,
    peer: SocketAddr,
    backend: &BackendEndpoint,
    sink: Arc<dyn EventSink>,
    _session: SessionGuard,
) -> Option<FuseStats>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    sink.emit(ProxyEvent::Incoming { peer });

    let upstream = match dial(backend).await {
        Ok(stream) => stream,
        Err(e) => {
            sink.emit(ProxyEvent::DialFailed {
                peer,
                backend: backend.address().to_string(),
                error: e.to_string(),
            });
            return None;
        }
    };

    let backend_addr = upstream.peer_addr().unwrap_or_else(|_| backend.dial_addr());
    Some(fuse(client, peer, upstream, backend_addr, sink).await)
}
