//! Listener generations.
//!
//! A generation is one listening socket bound to one server certificate.
//! It is created when a certificate becomes active and retired when a newer
//! one replaces it (or on shutdown). Retiring a generation stops its accept
//! loop; sessions it already dispatched keep running until their peers hang
//! up, and [`ListenerGeneration::wait_drained`] tells the caller when the
//! last one is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::acceptor::{Acceptor, AcceptorState};
use super::context::ProxyContext;
use super::socket::{bind_listener, ListenSocket};
use crate::error::{Error, Result};
use crate::events::ProxyEvent;
use crate::tls::{CertificateInfo, ServerIdentity};

/// Count of sessions dispatched by a generation that have not finished yet.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    /// Register a new session. The session ends when the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> SessionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            in_flight: Arc::clone(self),
            permit: None,
        }
    }

    /// Number of sessions still running.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no session is running.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks one running session; dropping it ends the session.
#[derive(Debug)]
pub struct SessionGuard {
    in_flight: Arc<InFlight>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    /// Hold an admission slot for the lifetime of the session.
    pub(crate) fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self.permit = permit;
        self
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Free the slot before anyone waiting on the drain can observe zero.
        drop(self.permit.take());
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

/// Receiving side of a generation's stop signal.
#[derive(Debug)]
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Non-blocking check. A dropped sender counts as a stop request.
    pub(crate) fn is_requested(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }
}

/// One listening socket bound to one server certificate.
#[derive(Debug)]
pub struct ListenerGeneration {
    local_addr: SocketAddr,
    certificate: CertificateInfo,
    stop_tx: watch::Sender<bool>,
    close_tx: watch::Sender<bool>,
    state: watch::Receiver<AcceptorState>,
    in_flight: Arc<InFlight>,
    task: Option<JoinHandle<()>>,
}

impl ListenerGeneration {
    /// Bind `listen_addr` with `identity` and start accepting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        listen_addr: SocketAddr,
        identity: &ServerIdentity,
        ctx: Arc<ProxyContext>,
    ) -> Result<Self> {
        let tls = identity.acceptor(Arc::clone(&ctx.client_roots))?;
        let listener = bind_listener(listen_addr).map_err(|source| Error::Bind {
            addr: listen_addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let certificate = identity.info().clone();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (close_tx, close_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(AcceptorState::Running);
        let in_flight = Arc::new(InFlight::default());

        ctx.sink.emit(ProxyEvent::GenerationStarted {
            listen_addr: local_addr,
            certificate: certificate.clone(),
        });

        let acceptor = Acceptor {
            socket: ListenSocket::new(listener, close_rx),
            tls,
            ctx,
            stop: StopSignal(stop_rx),
            state: state_tx,
            in_flight: Arc::clone(&in_flight),
            listen_addr: local_addr,
            certificate: certificate.clone(),
        };
        let span = tracing::info_span!(
            "listener",
            listen_addr = %local_addr,
            serial = %certificate.serial
        );
        let task = tokio::spawn(acceptor.run().instrument(span));

        Ok(Self {
            local_addr,
            certificate,
            stop_tx,
            close_tx,
            state,
            in_flight,
            task: Some(task),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Certificate this generation serves.
    pub fn certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    /// Current state of the accept loop.
    pub fn state(&self) -> AcceptorState {
        *self.state.borrow()
    }

    /// Number of dispatched sessions still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Deliver the stop signal. Returns `false` if it was already delivered.
    ///
    /// The accept loop only looks at the signal after an accept call
    /// returns, so on its own this takes effect when the next connection
    /// arrives. [`Self::stop`] also closes the socket.
    pub fn signal_stop(&self) -> bool {
        self.stop_tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Close the listening socket, unblocking a pending accept call.
    ///
    /// A closed socket fails every accept, so the stop signal goes out first
    /// and the loop exits instead of retrying.
    fn close_socket(&self) {
        self.signal_stop();
        self.close_tx.send_if_modified(|closed| {
            let changed = !*closed;
            *closed = true;
            changed
        });
    }

    /// Wait for the accept loop to exit.
    pub async fn wait_stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop task failed");
            }
        }
    }

    /// Stop accepting: signal, close the socket and wait for the loop to
    /// exit. Dispatched sessions are left running.
    pub async fn stop(&mut self) {
        self.close_socket();
        self.wait_stopped().await;
    }

    /// Wait until every dispatched session has finished.
    pub async fn wait_drained(&self) {
        self.in_flight.wait_drained().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use certgate_networking::BackendEndpoint;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    use crate::auth::AllowAll;
    use crate::events::EventSink;
    use crate::tls::client_roots;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProxyEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: ProxyEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn generation(sink: Arc<Recorder>) -> ListenerGeneration {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let identity = ServerIdentity::from_der(vec![der.clone()], key_der).unwrap();

        let ctx = ProxyContext::new(
            BackendEndpoint::new(SocketAddr::from(([127, 0, 0, 1], 9))),
            Arc::new(AllowAll),
            client_roots(vec![der]).unwrap(),
            sink,
        );
        ListenerGeneration::start("127.0.0.1:0".parse().unwrap(), &identity, Arc::new(ctx))
            .unwrap()
    }

    #[tokio::test]
    async fn test_closing_socket_stops_loop_without_accept_failures() {
        let sink = Arc::new(Recorder::default());
        let mut generation = generation(Arc::clone(&sink));

        generation.close_socket();
        tokio::time::timeout(Duration::from_secs(1), generation.wait_stopped())
            .await
            .unwrap();

        assert_eq!(generation.state(), AcceptorState::Stopped);
        assert!(!generation.signal_stop());
        let events = sink.0.lock().unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProxyEvent::AcceptFailed { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProxyEvent::GenerationRetired { .. })));
    }

    #[tokio::test]
    async fn test_in_flight_drain() {
        let in_flight = Arc::new(InFlight::default());
        let a = in_flight.enter();
        let b = in_flight.enter();
        assert_eq!(in_flight.count(), 2);

        let waiter = tokio::spawn({
            let in_flight = Arc::clone(&in_flight);
            async move { in_flight.wait_drained().await }
        });

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_released_on_panic() {
        let in_flight = Arc::new(InFlight::default());
        let guard = in_flight.enter();

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("session blew up");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(in_flight.count(), 0);
        in_flight.wait_drained().await;
    }

    #[test]
    fn test_stop_signal_dropped_sender() {
        let (tx, rx) = watch::channel(false);
        let signal = StopSignal(rx);
        assert!(!signal.is_requested());
        drop(tx);
        assert!(signal.is_requested());
    }
}
