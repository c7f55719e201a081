//! HTTP API for the engine.
//!
//! `RunContainer` outcomes, including domain failures, ride inside the 200
//! response body; HTTP error statuses are reserved for requests addressing
//! unknown containers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use gantry_api::{AgentStatus, ContainerStatus, RunContainerRequest, RunContainerResponse};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::container::ContainerManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<ContainerManager>,
}

impl AppState {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self { manager }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Create the agent API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/containers", post(run_container).get(list_containers))
        .route(
            "/v1/containers/{name}",
            get(get_container).delete(stop_container),
        )
        .route("/v1/status", get(agent_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn run_container(
    State(state): State<AppState>,
    Json(request): Json<RunContainerRequest>,
) -> Json<RunContainerResponse> {
    Json(state.manager.run_container(request).await)
}

async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerStatus>> {
    Json(state.manager.list().await)
}

async fn get_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerStatus>, (StatusCode, Json<ErrorBody>)> {
    match state.manager.status(&name).await {
        Some(status) => Ok(Json(status)),
        None => Err(not_found(&name)),
    }
}

async fn stop_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerStatus>, (StatusCode, Json<ErrorBody>)> {
    match state.manager.stop(&name).await {
        Some(status) => Ok(Json(status)),
        None => Err(not_found(&name)),
    }
}

async fn agent_status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(state.manager.agent_status().await)
}

fn not_found(name: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("no container named {name} on this agent"),
        }),
    )
}
