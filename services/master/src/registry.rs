//! Agent registry: endpoint-keyed cache of agent self-reports.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use gantry_api::AgentStatus;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

/// Heartbeat-fed registry. Entries older than the TTL are treated as
/// stale, pushing callers to a live probe of the agent.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    ttl: Duration,
}

impl AgentRegistry {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::seconds(30)),
        }
    }

    pub async fn record_heartbeat(&self, endpoint: &str, status: AgentStatus) {
        self.record_at(endpoint, status, Utc::now()).await;
    }

    pub(crate) async fn record_at(&self, endpoint: &str, status: AgentStatus, seen: DateTime<Utc>) {
        debug!(endpoint = %endpoint, containers = status.containers, "agent status recorded");
        self.agents.write().await.insert(
            endpoint.to_string(),
            AgentRecord {
                status,
                last_seen: seen,
            },
        );
    }

    /// The agent's status, if the registry has a fresh report for it.
    pub async fn fresh_status(&self, endpoint: &str) -> Option<AgentStatus> {
        let agents = self.agents.read().await;
        let record = agents.get(endpoint)?;
        if Utc::now() - record.last_seen > self.ttl {
            return None;
        }
        Some(record.status.clone())
    }

    pub async fn list(&self) -> Vec<(String, AgentRecord)> {
        let agents = self.agents.read().await;
        let mut entries: Vec<(String, AgentRecord)> = agents
            .iter()
            .map(|(endpoint, record)| (endpoint.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
