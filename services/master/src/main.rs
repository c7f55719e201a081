//! gantry master
//!
//! The cluster scheduler. An external planner decides where pods should
//! run and sends scale-up proposals here; the master validates each one
//! against the agent registry and live capacity, dispatches the container
//! to the chosen agent, and owns the resulting binding table.

use std::sync::Arc;

use anyhow::Result;
use gantry_api::Container;
use gantry_master::client::EngineClient;
use gantry_master::registry::AgentRegistry;
use gantry_master::scheduler::{PodSpecs, Scheduler, SchedulerConfig, StaticPodSpecs};
use gantry_master::{api, config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gantry master");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let specs: Arc<dyn PodSpecs> = match &config.pod_specs_file {
        Some(path) => {
            let specs = StaticPodSpecs::from_file(path)?;
            info!(path = %path.display(), "pod specs loaded");
            Arc::new(specs)
        }
        None => Arc::new(StaticPodSpecs::new(Container::process())),
    };

    let registry = Arc::new(AgentRegistry::new(config.agent_ttl));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&registry),
        EngineClient::new()?,
        specs,
        SchedulerConfig {
            call_timeout: config.call_timeout,
            probe_timeout: config.probe_timeout,
            default_reservation: config.default_reservation,
        },
    ));

    let state = api::AppState::new(scheduler, registry);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Master shutdown complete");
    Ok(())
}
