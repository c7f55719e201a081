//! gantry engine
//!
//! The per-node container runtime agent. It serves `RunContainer` and the
//! container inspection API, fetches image artifacts, boots one initd per
//! container, accounts resources, and reports itself to the master.
//!
//! ## Architecture
//!
//! - **Container Manager**: lock-protected container table and lifecycle
//!   state machine
//! - **Runtime**: prepares execution contexts and boots per-container initds
//! - **Heartbeat Loop**: reports capacity and usage to the master
//! - **Exit Watcher**: rolls containers whose supervisor died

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gantry_engine::client::InitdClient;
use gantry_engine::container::{ContainerManager, ContainerManagerConfig};
use gantry_engine::fetch::{FetcherConfig, ImageFetcher};
use gantry_engine::runtime::{LocalRuntime, LocalRuntimeConfig};
use gantry_engine::store::StateStore;
use gantry_engine::{api, config, heartbeat};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gantry engine");
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        cpu_millis = config.capacity.cpu_millis,
        memory_bytes = config.capacity.memory_bytes,
        "Configuration loaded"
    );

    let images_dir = config.data_dir.join("images");
    std::fs::create_dir_all(&images_dir)?;

    let runtime = Arc::new(LocalRuntime::new(LocalRuntimeConfig {
        root: config.data_dir.join("containers"),
        initd_bin: config.initd_bin.clone(),
        boot_poll_interval: Duration::from_millis(200),
        boot_max_polls: 50,
    })?);

    let store = StateStore::open(config.data_dir.join("state.db"))?;

    let manager = Arc::new(ContainerManager::new(
        ContainerManagerConfig {
            capacity: config.capacity,
            default_reservation: config.default_reservation,
            images_dir,
        },
        runtime,
        ImageFetcher::new(FetcherConfig::default())?,
        InitdClient::new(config.initd_call_timeout)?,
        Some(store),
    ));

    match manager.rebuild_from_store().await {
        Ok(0) => {}
        Ok(count) => info!(count, "rebuilt container table from state store"),
        Err(e) => error!(error = %e, "failed to rebuild container table"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn({
        let config = config.clone();
        let manager = Arc::clone(&manager);
        let shutdown_rx = shutdown_rx.clone();
        async move { heartbeat::run_heartbeat_loop(config, manager, shutdown_rx).await }
    });

    // Exit watcher: observe supervisors and roll dead containers.
    let watcher_handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let mut shutdown_rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.exit_check_interval_secs.max(1));
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.check_exits().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let state = api::AppState::new(Arc::clone(&manager));
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let mut shutdown_rx = shutdown_rx.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                    }
                    _ = shutdown_rx.changed() => {}
                }
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = heartbeat_handle.await;
    let _ = watcher_handle.await;

    info!("Engine shutdown complete");
    Ok(())
}
