//! Build endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use buildfarm_core::build::{Build, BuildSpec};
use buildfarm_core::job::Job;
use buildfarm_core::{BuildId, JobId};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(queue_build))
        .route("/{id}/cancel", post(cancel_build))
        .route("/{id}/retry", post(retry_build))
}

#[derive(Debug, Deserialize)]
struct QueueBuildRequest {
    spec: BuildSpec,
    #[serde(default)]
    requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    build_id: BuildId,
    job_id: JobId,
    score: i32,
}

async fn queue_build(
    State(state): State<AppState>,
    Json(req): Json<QueueBuildRequest>,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let queued = state.admin.queue_build(req.spec, req.requested_by).await?;
    Ok((
        StatusCode::CREATED,
        Json(QueuedResponse {
            build_id: queued.build.id,
            job_id: queued.job.id,
            score: queued.job.score,
        }),
    ))
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(state.admin.cancel_build(BuildId::new(id)).await?))
}

async fn retry_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.admin.retry_build(BuildId::new(id)).await?))
}
