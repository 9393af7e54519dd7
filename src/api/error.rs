//! Mapping of library errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::detect::source::SourceError;
use crate::detect::DetectError;

#[derive(Debug)]
pub enum ApiError {
    /// A failure from a workflow call.
    Detect(DetectError),
    /// A detection run that did not complete.
    RunFailed(DetectError),
    /// A blocking task panicked or was cancelled.
    Task(tokio::task::JoinError),
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        Self::Detect(e)
    }
}

impl From<SourceError> for ApiError {
    fn from(e: SourceError) -> Self {
        Self::Detect(e.into())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Detect(e @ DetectError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            Self::Detect(e @ DetectError::InvalidTransition { .. }) => (StatusCode::CONFLICT, e.to_string()),
            Self::Detect(e @ (DetectError::InvalidRule { .. } | DetectError::UnknownMetric(_))) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            Self::Detect(DetectError::Source(e)) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Self::RunFailed(e) => {
                error!(error = %e, "Detection run failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "detection run failed".to_string())
            }
            Self::Task(e) => {
                error!(error = %e, "Blocking task failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(json!({ "error": { "status": status.as_u16(), "message": message } }))).into_response()
    }
}
