//! Mux mode: serves S3 requests on one port.
//!
//! In this mode, the daemon:
//! 1. Connects to the store and resolves the trusted proxies
//! 2. Registers itself under `mx:` and keeps the record fresh
//! 3. Serves requests, spawning Managers for pools without a backend
//! 4. On shutdown, drains connections and drops its registration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use lens3_core::Lens3Config;
use lens3_manager::{Activator, Spawner};
use lens3_mux::{Mux, TrustedPeers, build_router, run_registration};
use lens3_state::Tables;
use tokio::sync::watch;
use tracing::info;

pub async fn run_mux(conf_path: PathBuf, host: String, port: u16) -> anyhow::Result<()> {
    info!("Lens3 mux starting");

    // Managers are started from other directories.
    let conf_path = std::path::absolute(&conf_path)?;
    let config = Lens3Config::from_file(&conf_path)
        .with_context(|| format!("reading {}", conf_path.display()))?;
    info!(path = %conf_path.display(), "configuration loaded");

    // ── Store ────────────────────────────────────────────────────
    let tables = Tables::connect(&config.redis).await?;
    info!(url = %config.redis.url, "store connected");

    // ── Peers and activation ─────────────────────────────────────
    let proxies = TrustedPeers::resolve(&config.mux.trusted_proxies).await;
    info!(count = proxies.len(), "trusted proxies resolved");
    let peers = TrustedPeers::new(proxies);

    let spawner = Spawner::from_config(&config, &conf_path, &host, port);
    let connector = Arc::new(Activator::new(tables.clone(), spawner, &config));
    let mux = Mux::new(tables.clone(), config.mux.clone(), peers, connector)?;

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(crate::forward_signals(shutdown_tx));

    let registration = tokio::spawn(run_registration(
        tables,
        config.mux.clone(),
        host,
        port,
        shutdown_rx.clone(),
    ));

    // ── Serve ────────────────────────────────────────────────────
    let router = build_router(Arc::new(mux));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "mux listening");

    let mut server_shutdown = shutdown_rx;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    })
    .await?;

    let _ = registration.await;
    info!("Lens3 mux stopped");
    Ok(())
}
