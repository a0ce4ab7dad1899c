//! certgate
//!
//! Mutually-authenticated TLS forwarding proxy.
//!
//! Clients connect over TLS and must present a certificate signed by the
//! configured CA. Once an authorization policy accepts the peer chain, the
//! decrypted stream is relayed byte-for-byte to a single TCP backend.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod proxy;
pub mod rotation;
pub mod tls;

pub use error::{Error, Result};
pub use proxy::{AcceptorState, FuseStats, ListenerGeneration, ProxyContext};
pub use rotation::{CertificatePaths, Rotator};
