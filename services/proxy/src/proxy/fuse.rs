//! Bidirectional byte relay between a client and the backend.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::events::{EventSink, ProxyEvent};

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Bytes relayed by one fused session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FuseStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes between `client` and `backend` until one side closes.
///
/// backend -> client runs on a spawned task, client -> backend on the
/// caller's. A direction ends at end-of-stream or on its first I/O error and
/// shuts down its destination's write side. The first direction to end also
/// ends the other one, so a peer that stays open and silent cannot hold the
/// session after its counterpart has hung up. Both connections are closed
/// once this returns and they are dropped.
pub async fn fuse<C, B>(
    client: C,
    client_addr: SocketAddr,
    backend: B,
    backend_addr: SocketAddr,
    sink: Arc<dyn EventSink>,
) -> FuseStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let (hangup, _) = watch::channel(false);
    let hangup = Arc::new(hangup);

    let reverse = tokio::spawn({
        let sink = Arc::clone(&sink);
        let hangup = Arc::clone(&hangup);
        async move {
            copy_data(
                client_write,
                client_addr,
                backend_read,
                backend_addr,
                sink.as_ref(),
                &hangup,
            )
            .await
        }
    });

    let client_to_backend = copy_data(
        backend_write,
        backend_addr,
        client_read,
        client_addr,
        sink.as_ref(),
        &hangup,
    )
    .await;

    let backend_to_client = match reverse.await {
        Ok(bytes) => bytes,
        Err(e) => {
            sink.emit(ProxyEvent::PipeFailed {
                dst: client_addr,
                src: backend_addr,
                error: e.to_string(),
            });
            0
        }
    };

    FuseStats {
        client_to_backend,
        backend_to_client,
    }
}

/// Copy `src` into `dst` until end-of-stream, error, or the opposite
/// direction ending. Returns bytes copied.
async fn copy_data<W, R>(
    mut dst: W,
    dst_addr: SocketAddr,
    mut src: R,
    src_addr: SocketAddr,
    sink: &dyn EventSink,
    hangup: &watch::Sender<bool>,
) -> u64
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    sink.emit(ProxyEvent::PipeOpened {
        dst: dst_addr,
        src: src_addr,
    });

    let mut peer_done = hangup.subscribe();
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let result = loop {
        let step = async {
            let n = src.read(&mut buf).await?;
            if n > 0 {
                dst.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        tokio::select! {
            _ = peer_done.wait_for(|done| *done) => break Ok(()),
            step = step => match step {
                Ok(0) => break Ok(()),
                Ok(n) => total += n as u64,
                Err(e) => break Err(e),
            },
        }
    };
    hangup.send_replace(true);

    if let Err(e) = result {
        sink.emit(ProxyEvent::PipeFailed {
            dst: dst_addr,
            src: src_addr,
            error: e.to_string(),
        });
    }

    // The peer may already be gone.
    let _ = dst.shutdown().await;

    sink.emit(ProxyEvent::PipeClosed {
        dst: dst_addr,
        src: src_addr,
        bytes: total,
    });

    total
}
