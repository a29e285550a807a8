//! TLS passthrough proxy
//!
//! This service:
//! - Loads passthrough routes from a routes file and watches it for changes
//! - Accepts TCP connections on the passthrough port
//! - Routes each connection by the SNI in its TLS ClientHello
//! - Relays the encrypted stream to the backend untouched
//! - Optionally prepends a PROXY protocol v1 header for the backend

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tls_passthrough::{
    reload, Config, Listener, Passthrough, RoutesWatcher, RoutingTable, SharedRoutingTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PASSTHROUGH_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting TLS passthrough");
    info!(
        listen_addr = %config.listen_addr,
        routes_file = ?config.routes_file,
        default_backend = ?config.default_backend.as_ref().map(|t| t.dial_addr()),
        accept_proxy_protocol = config.accept_proxy_protocol,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let table = Arc::new(SharedRoutingTable::new(RoutingTable::new(
        Vec::new(),
        config.default_backend.clone(),
    )));

    match &config.routes_file {
        Some(path) => {
            let mut watcher = RoutesWatcher::new(path.clone(), Arc::clone(&table))
                .with_fallback_default(config.default_backend.clone());
            let target_count = watcher
                .load_initial()
                .context("Failed to load initial routes")?;
            info!(target_count, "Initial routes applied");

            let interval = config.reload_interval;
            tokio::spawn(async move {
                reload::run_watcher(&mut watcher, interval).await;
            });
        }
        None => {
            if config.default_backend.is_none() {
                warn!("No routes file and no default backend; every connection will be dropped");
            }
        }
    }

    let passthrough = Arc::new(Passthrough::new(
        Arc::clone(&table),
        config.passthrough_config(),
    ));

    let listener = Listener::bind(config.listener_config(), passthrough)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;
    let listener = Arc::new(listener);

    if let Err(e) = listener.run().await {
        error!(error = %e, "Listener error");
        return Err(e.into());
    }

    Ok(())
}
