//! Queue entry endpoints.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use buildfarm_core::JobId;
use buildfarm_core::job::Job;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/score", post(rescore))
}

#[derive(Debug, Deserialize)]
struct RescoreRequest {
    score: i32,
}

async fn rescore(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RescoreRequest>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.admin.rescore(JobId::new(id), req.score).await?))
}
