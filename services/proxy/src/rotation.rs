//! Certificate rotation.
//!
//! The proxy serves one [`ListenerGeneration`] at a time. When the
//! certificate files change, a new generation is bound to the same address
//! (the socket uses `SO_REUSEPORT`), the old one is stopped and its sessions
//! drain in the background. Reloads are triggered by `SIGHUP` and, when
//! configured, on a fixed interval.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::Result;
use crate::events::ProxyEvent;
use crate::proxy::{ListenerGeneration, ProxyContext};
use crate::tls::ServerIdentity;

/// Where the server certificate and key are read from.
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificatePaths {
    pub fn load(&self) -> Result<ServerIdentity> {
        ServerIdentity::load(&self.cert, &self.key)
    }
}

/// Owns the active listener generation and replaces it on rotation.
pub struct Rotator {
    paths: CertificatePaths,
    ctx: Arc<ProxyContext>,
    current: ListenerGeneration,
    retiring: JoinSet<()>,
}

impl Rotator {
    /// Load the certificate and start the first generation on `listen_addr`.
    pub fn start(
        listen_addr: SocketAddr,
        paths: CertificatePaths,
        ctx: Arc<ProxyContext>,
    ) -> Result<Self> {
        let identity = paths.load()?;
        let current = ListenerGeneration::start(listen_addr, &identity, Arc::clone(&ctx))?;
        Ok(Self {
            paths,
            ctx,
            current,
            retiring: JoinSet::new(),
        })
    }

    /// The generation currently accepting connections.
    pub fn current(&self) -> &ListenerGeneration {
        &self.current
    }

    /// Number of replaced generations still draining.
    pub fn retiring(&self) -> usize {
        self.retiring.len()
    }

    /// Re-read the certificate files and rotate if the certificate changed.
    ///
    /// Returns whether a new generation was started. On failure the current
    /// generation keeps serving.
    pub async fn reload(&mut self) -> Result<bool> {
        match self.try_rotate() {
            Ok(rotated) => {
                self.ctx.sink.emit(ProxyEvent::CertificateReloaded {
                    certificate: self.current.certificate().clone(),
                    rotated,
                });
                Ok(rotated)
            }
            Err(e) => {
                self.ctx.sink.emit(ProxyEvent::CertificateReloadFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn try_rotate(&mut self) -> Result<bool> {
        let identity = self.paths.load()?;
        if identity.info() == self.current.certificate() {
            return Ok(false);
        }

        let next = ListenerGeneration::start(
            self.current.local_addr(),
            &identity,
            Arc::clone(&self.ctx),
        )?;
        let previous = std::mem::replace(&mut self.current, next);
        self.retire(previous);
        Ok(true)
    }

    fn retire(&mut self, mut generation: ListenerGeneration) {
        let sink = Arc::clone(&self.ctx.sink);
        self.retiring.spawn(async move {
            generation.stop().await;
            generation.wait_drained().await;
            sink.emit(ProxyEvent::GenerationDrained {
                certificate: generation.certificate().clone(),
            });
        });
    }

    /// Serve until `shutdown` resolves, reloading on `SIGHUP` and every
    /// `reload_interval`.
    pub async fn run<F>(&mut self, reload_interval: Option<Duration>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut hangup = match Hangup::new() {
            Ok(hangup) => Some(hangup),
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP, reload on signal disabled");
                None
            }
        };
        let mut ticker = reload_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.reset();
            ticker
        });

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = recv_hangup(&mut hangup) => {
                    info!("Received SIGHUP, reloading certificate");
                    let _ = self.reload().await;
                }
                _ = next_tick(&mut ticker) => {
                    let _ = self.reload().await;
                }
                Some(_) = self.retiring.join_next(), if !self.retiring.is_empty() => {}
            }
        }
    }

    /// Stop accepting and wait up to `drain_timeout` for every session of
    /// every generation to finish. Returns whether everything drained.
    ///
    /// The timeout also bounds stopping the acceptor, which may be busy with a
    /// handshake from a peer that never sends anything.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> bool {
        let current = &mut self.current;
        let retiring = &mut self.retiring;
        let drained = tokio::time::timeout(drain_timeout, async {
            current.stop().await;
            current.wait_drained().await;
            while retiring.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            self.ctx.sink.emit(ProxyEvent::GenerationDrained {
                certificate: self.current.certificate().clone(),
            });
        } else {
            warn!(
                in_flight = self.current.in_flight(),
                retiring = self.retiring.len(),
                "Shutdown timeout reached with sessions still open"
            );
        }
        drained
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_hangup(hangup: &mut Option<Hangup>) {
    match hangup {
        Some(hangup) => hangup.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::hangup()).map(Hangup)
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "SIGHUP is not available on this platform",
        ))
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
