//! HTTP API for the init supervisor.
//!
//! `Fork` failures ride inside the 200 response body; HTTP error statuses
//! are reserved for requests that do not address a tracked process.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use gantry_api::{ForkRequest, ForkResponse, KillProcessRequest, ProcessStatus};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::supervisor::Supervisor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Create the supervisor API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/processes", post(fork).get(list_processes))
        .route("/v1/processes/{pid}", get(get_process))
        .route("/v1/processes/{pid}/kill", post(kill_process))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn fork(State(state): State<AppState>, Json(req): Json<ForkRequest>) -> Json<ForkResponse> {
    match state.supervisor.fork(req.process).await {
        Ok(pid) => Json(ForkResponse::launched(pid)),
        Err(e) => {
            warn!(error = %e, "fork rejected");
            Json(ForkResponse {
                pid: None,
                status: gantry_api::ForkStatus::Failed,
                error: Some(e.to_wire()),
            })
        }
    }
}

async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessStatus>> {
    Json(state.supervisor.list().await)
}

async fn get_process(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<ProcessStatus>, (StatusCode, Json<ErrorBody>)> {
    match state.supervisor.status(pid).await {
        Some(status) => Ok(Json(status)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no tracked process with pid {pid}"),
            }),
        )),
    }
}

async fn kill_process(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
    Json(req): Json<KillProcessRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    match state.supervisor.kill(pid, req.signal).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )),
    }
}
