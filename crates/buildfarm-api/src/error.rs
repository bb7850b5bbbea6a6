//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<buildfarm_core::Error> for ApiError {
    fn from(err: buildfarm_core::Error) -> Self {
        match err {
            buildfarm_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            buildfarm_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            buildfarm_core::Error::Protocol(msg) => ApiError::BadRequest(msg),
            buildfarm_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            buildfarm_core::Error::BuildRejected(msg) => ApiError::Conflict(msg),
            e if e.is_worker_fault() => ApiError::BadGateway(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}
