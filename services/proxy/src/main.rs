//! certgate
//!
//! This service:
//! - Terminates mutual TLS on a configured listen address
//! - Authorizes clients by their certificate identity
//! - Relays each authorized connection to a single backend
//! - Rotates its server certificate without dropping sessions

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use certgate_proxy::config::Config;
use certgate_proxy::events::TracingSink;
use certgate_proxy::{tls, ProxyContext, Rotator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CERTGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting certgate");

    let backend = config.resolve_backend().await?;
    info!(
        listen_addr = %config.listen_addr,
        backend = %backend,
        max_connections = ?config.max_connections,
        reload_interval_secs = ?config.reload_interval.map(|d| d.as_secs()),
        "Configuration loaded"
    );

    let client_roots = tls::load_client_roots(&config.ca_cert)
        .with_context(|| format!("Failed to load CA bundle {}", config.ca_cert.display()))?;

    let mut ctx = ProxyContext::new(
        backend,
        config.allow.policy(),
        client_roots,
        Arc::new(TracingSink),
    );
    if let Some(max_connections) = config.max_connections {
        ctx = ctx.with_max_connections(max_connections);
    }

    let mut rotator = Rotator::start(config.listen_addr, config.certificate.clone(), Arc::new(ctx))
        .context("Failed to start listener")?;

    rotator
        .run(config.reload_interval, shutdown_signal())
        .await;

    info!("Shutting down, waiting for open sessions");
    if !rotator.shutdown(config.shutdown_timeout).await {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Exiting with sessions still open"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
