//! HTTP API for the master.
//!
//! `/v1/scale-up/propose` serves the external planner; the agent-facing
//! heartbeat and the read-only listings serve agents and operators.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use gantry_api::{AgentHeartbeat, AgentStatus, ScaleUpProposeRequest, ScaleUpProposeResponse};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    scheduler: Arc<Scheduler>,
    registry: Arc<AgentRegistry>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            scheduler,
            registry,
        }
    }
}

/// One registered agent, for operator listings.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub endpoint: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

/// One committed binding, for operator listings.
#[derive(Debug, Serialize, Deserialize)]
pub struct BindingInfo {
    pub pod_name: String,
    pub endpoint: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
}

/// Create the master API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/scale-up/propose", post(scale_up_propose))
        .route("/v1/agents/heartbeat", post(agent_heartbeat))
        .route("/v1/agents", get(list_agents))
        .route("/v1/bindings", get(list_bindings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn scale_up_propose(
    State(state): State<AppState>,
    Json(request): Json<ScaleUpProposeRequest>,
) -> Json<ScaleUpProposeResponse> {
    Json(state.scheduler.scale_up_propose(request).await)
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<AgentHeartbeat>,
) -> Json<HeartbeatAck> {
    state
        .registry
        .record_heartbeat(&heartbeat.endpoint, heartbeat.status)
        .await;
    Json(HeartbeatAck { accepted: true })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    let agents = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|(endpoint, record)| AgentInfo {
            endpoint,
            status: record.status,
            last_seen: record.last_seen,
        })
        .collect();
    Json(agents)
}

async fn list_bindings(State(state): State<AppState>) -> Json<Vec<BindingInfo>> {
    let bindings = state
        .scheduler
        .bindings()
        .await
        .into_iter()
        .map(|(pod_name, binding)| BindingInfo {
            pod_name,
            endpoint: binding.endpoint,
            bound_at: binding.bound_at,
        })
        .collect();
    Json(bindings)
}
