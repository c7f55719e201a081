//! Heartbeat loop reporting this agent's status to the master.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gantry_api::AgentHeartbeat;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::MasterClient;
use crate::config::Config;
use crate::container::ContainerManager;

pub async fn run_heartbeat_loop(
    config: Config,
    manager: Arc<ContainerManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let Some(master_url) = config.master_url.clone() else {
        info!("no master configured, heartbeat disabled");
        return Ok(());
    };

    let client = MasterClient::new(&master_url, Duration::from_secs(10))?;
    let endpoint = config
        .advertise_endpoint
        .clone()
        .unwrap_or_else(|| config.listen_addr.to_string());

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let status = manager.agent_status().await;
                debug!(
                    endpoint = %endpoint,
                    containers = status.containers,
                    used_cpu_millis = status.used.cpu_millis,
                    "sending heartbeat"
                );
                let heartbeat = AgentHeartbeat {
                    endpoint: endpoint.clone(),
                    status,
                };
                if let Err(e) = client.heartbeat(&heartbeat).await {
                    warn!(error = %e, "heartbeat to master failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("heartbeat loop shutting down");
                    return Ok(());
                }
            }
        }
    }
}
