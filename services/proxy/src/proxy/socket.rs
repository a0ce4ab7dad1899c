//! Socket helpers.
//!
//! Sockets are created per transport family: tokio's `TcpSocket` has no
//! generic "tcp" constructor, so every bind and dial picks `new_v4` or
//! `new_v6` from the address's [`TransportFamily`].

use std::io;
use std::net::SocketAddr;

use certgate_networking::{unmap_ipv4, BackendEndpoint, TransportFamily};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

/// Listen backlog for generation sockets.
const LISTEN_BACKLOG: u32 = 1024;

/// Create an unbound socket of the given family.
pub(crate) fn new_socket(family: TransportFamily) -> io::Result<TcpSocket> {
    match family {
        TransportFamily::Tcp4 => TcpSocket::new_v4(),
        TransportFamily::Tcp6 => TcpSocket::new_v6(),
    }
}

/// Bind a listening socket.
///
/// The socket sets `SO_REUSEPORT` on unix so that a successor generation can
/// bind the same address while the current one is still accepting.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let addr = unmap_ipv4(addr);
    let socket = new_socket(TransportFamily::of(&addr))?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Open a fresh connection to the backend.
pub async fn dial(backend: &BackendEndpoint) -> io::Result<TcpStream> {
    let socket = new_socket(backend.family())?;
    socket.connect(backend.dial_addr()).await
}

/// A generation's listening socket.
///
/// The owning acceptor task is the only one that accepts on it. The
/// supervisor closes it through the `closed` latch: once closed, a pending or
/// future `accept` returns an error immediately. The file descriptor itself
/// is released when the acceptor drops this value.
pub(crate) struct ListenSocket {
    listener: TcpListener,
    closed: watch::Receiver<bool>,
}

impl ListenSocket {
    pub(crate) fn new(listener: TcpListener, closed: watch::Receiver<bool>) -> Self {
        Self { listener, closed }
    }

    /// Wait for the next connection.
    pub(crate) async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        tokio::select! {
            biased;
            // A dropped latch counts as closed.
            _ = self.closed.wait_for(|closed| *closed) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listening socket closed",
            )),
            result = self.listener.accept() => result,
        }
    }
}
