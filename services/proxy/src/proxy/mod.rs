//! mTLS forwarding proxy core.
//!
//! This module provides:
//! - Listener generations (one socket per server certificate)
//! - The accept loop: TLS check, forced handshake, authorization
//! - Session handling: backend dial and bidirectional relay
//!
//! ## Architecture
//!
//! ```text
//! ListenerGeneration -> Acceptor -> handshake -> AuthorizationPolicy
//!                                                      |
//!                                  handler -> dial backend -> fuse
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let ctx = Arc::new(ProxyContext::new(backend, policy, client_roots, sink));
//! let mut generation = ListenerGeneration::start(listen_addr, &identity, ctx)?;
//! // ... later, on rotation or shutdown
//! generation.stop().await;
//! generation.wait_drained().await;
//! ```

mod acceptor;
mod context;
mod fuse;
mod generation;
mod handler;
mod socket;

pub use acceptor::AcceptorState;
pub use context::ProxyContext;
pub use fuse::{fuse, FuseStats};
pub use generation::{InFlight, ListenerGeneration, SessionGuard};
pub use handler::handle;
pub use socket::dial;
