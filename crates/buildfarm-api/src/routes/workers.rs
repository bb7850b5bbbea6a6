//! Worker endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfarm_core::report::StatusReport;
use buildfarm_core::worker::Worker;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/{name}/disable", post(disable_worker))
        .route("/{name}/enable", post(enable_worker))
        .route("/{name}/status", post(push_status))
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.admin.list_workers().await?))
}

#[derive(Debug, Deserialize)]
struct DisableRequest {
    reason: String,
}

async fn disable_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<DisableRequest>,
) -> Result<Json<Worker>, ApiError> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("a reason is required".to_string()));
    }
    Ok(Json(state.admin.disable_worker(&name, &req.reason).await?))
}

async fn enable_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.admin.enable_worker(&name).await?))
}

/// Status report pushed by the worker itself. It is handled by the worker's
/// scanner like a polled one.
async fn push_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ApiError> {
    report.validate()?;
    state.reports.push(&name, report).await?;
    Ok(StatusCode::ACCEPTED)
}
