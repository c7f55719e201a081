//! gantry initd
//!
//! The init supervisor for one container. Booted by the engine inside the
//! container's execution context, it forks workload processes under a
//! requested identity and tracks their exits.

use std::sync::Arc;

use anyhow::Result;
use gantry_initd::{api, config, supervisor::Supervisor};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gantry initd");

    let state = api::AppState::new(Arc::new(Supervisor::new()));
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Listening for connections");

    // Let the booting agent discover an ephemeral port.
    if let Some(path) = &config.endpoint_file {
        std::fs::write(path, local_addr.to_string())?;
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Initd shutdown complete");
    Ok(())
}
