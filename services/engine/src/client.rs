//! HTTP clients toward a container's initd and the master.

use std::time::Duration;

use anyhow::{Context, Result};
use gantry_api::{AgentHeartbeat, ForkRequest, ForkResponse};
use tracing::debug;

/// Client for a container's init supervisor.
pub struct InitdClient {
    client: reqwest::Client,
}

impl InitdClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build initd client")?;
        Ok(Self { client })
    }

    /// Whether the initd at `endpoint` answers its health probe.
    pub async fn healthy(&self, endpoint: &str) -> bool {
        match self
            .client
            .get(format!("http://{endpoint}/healthz"))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Fork a process under the initd at `endpoint`.
    pub async fn fork(&self, endpoint: &str, request: &ForkRequest) -> Result<ForkResponse> {
        debug!(endpoint = %endpoint, process = %request.process.name, "forking via initd");
        let response = self
            .client
            .post(format!("http://{endpoint}/v1/processes"))
            .json(request)
            .send()
            .await
            .with_context(|| format!("fork call to initd at {endpoint} failed"))?;

        response
            .json()
            .await
            .with_context(|| format!("invalid fork response from initd at {endpoint}"))
    }
}

/// Client for the master's agent-facing API.
pub struct MasterClient {
    client: reqwest::Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build master client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Report this agent's status to the master.
    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/agents/heartbeat", self.base_url))
            .json(heartbeat)
            .send()
            .await
            .context("heartbeat request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("master rejected heartbeat with status {}", response.status());
        }
        Ok(())
    }
}
