//! Collaborators shared by every listener generation.

use std::sync::Arc;

use certgate_networking::BackendEndpoint;
use rustls::RootCertStore;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::auth::AuthorizationPolicy;
use crate::events::EventSink;

/// What a generation needs besides its socket and certificate.
pub struct ProxyContext {
    /// Where authorized traffic goes.
    pub backend: BackendEndpoint,
    /// Decides whether a verified client may proceed.
    pub policy: Arc<dyn AuthorizationPolicy>,
    /// Trust anchors for client certificates.
    pub client_roots: Arc<RootCertStore>,
    /// Receives lifecycle events.
    pub sink: Arc<dyn EventSink>,
    /// Optional bound on concurrently running sessions.
    admission: Option<Arc<Semaphore>>,
}

impl ProxyContext {
    pub fn new(
        backend: BackendEndpoint,
        policy: Arc<dyn AuthorizationPolicy>,
        client_roots: Arc<RootCertStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            policy,
            client_roots,
            sink,
            admission: None,
        }
    }

    /// Bound the number of concurrently running sessions across generations.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.admission = Some(Arc::new(Semaphore::new(max_connections)));
        self
    }

    /// Try to take an admission slot for a new session.
    pub(crate) fn admit(&self) -> Admission {
        match &self.admission {
            None => Admission::Unbounded,
            Some(gate) => match Arc::clone(gate).try_acquire_owned() {
                Ok(permit) => Admission::Admitted(permit),
                Err(_) => Admission::Full,
            },
        }
    }
}

/// Outcome of asking the admission gate for a slot.
#[derive(Debug)]
pub(crate) enum Admission {
    /// No gate configured.
    Unbounded,
    /// Slot taken; released when the permit drops.
    Admitted(OwnedSemaphorePermit),
    /// Every slot is in use.
    Full,
}
