//! HTTP client toward the agents' engine API.

use std::time::Duration;

use gantry_api::{AgentStatus, RunContainerRequest, RunContainerResponse};
use thiserror::Error;
use tracing::debug;

/// Errors from calls into an agent.
#[derive(Debug, Error)]
pub enum EngineCallError {
    /// The agent could not be reached, or the call timed out.
    #[error("agent at {endpoint} unreachable: {detail}")]
    Unreachable { endpoint: String, detail: String },

    /// The agent answered with something that is not its protocol.
    #[error("unexpected response from agent at {endpoint}: {detail}")]
    BadResponse { endpoint: String, detail: String },
}

pub struct EngineClient {
    client: reqwest::Client,
}

impl EngineClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build engine client: {e}"))?;
        Ok(Self { client })
    }

    /// Issue `RunContainer` to the agent at `endpoint`, bounded by `timeout`.
    pub async fn run_container(
        &self,
        endpoint: &str,
        request: &RunContainerRequest,
        timeout: Duration,
    ) -> Result<RunContainerResponse, EngineCallError> {
        debug!(endpoint = %endpoint, name = %request.name, "dispatching RunContainer");
        let response = self
            .client
            .post(format!("http://{endpoint}/v1/containers"))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineCallError::Unreachable {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineCallError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: format!("status {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineCallError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })
    }

    /// Fetch the agent's live status, bounded by `timeout`.
    pub async fn agent_status(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<AgentStatus, EngineCallError> {
        let response = self
            .client
            .get(format!("http://{endpoint}/v1/status"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| EngineCallError::Unreachable {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineCallError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: format!("status {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineCallError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })
    }
}
