use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::db::StoreError;
use crate::services::executor::ExecuteError;
use crate::services::ingest::IngestError;

/// Error type for HTTP handlers. Renders `{"error", "code"}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ApiResult<T> = Result<T, ApiError>;

fn internal(error: &dyn std::fmt::Display) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %error, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

fn classify_store(err: &StoreError) -> (StatusCode, &'static str, String) {
    match err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        StoreError::Transition(t) => (StatusCode::CONFLICT, "INVALID_STATE", t.to_string()),
        StoreError::Superseded { .. } => (StatusCode::CONFLICT, "INVALID_STATE", err.to_string()),
        other => internal(other),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE", msg.clone())
            }

            ApiError::Ingest(err) => match err {
                IngestError::MissingFile => {
                    (StatusCode::BAD_REQUEST, "MISSING_FILE", err.to_string())
                }
                IngestError::EmptyFile => (StatusCode::BAD_REQUEST, "EMPTY_FILE", err.to_string()),
                IngestError::InvalidMetadata(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
                }
                IngestError::UnsupportedType(_) => (
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "UNSUPPORTED_TYPE",
                    err.to_string(),
                ),
                IngestError::TooLarge { .. } => {
                    (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE", err.to_string())
                }
                IngestError::Storage(e) => internal(e),
                IngestError::Store(e) => classify_store(e),
            },

            ApiError::Execute(err) => match err {
                ExecuteError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
                ExecuteError::NotRetryable { .. } => {
                    (StatusCode::CONFLICT, "NOT_RETRYABLE", err.to_string())
                }
                ExecuteError::QueueUnavailable(e) => {
                    tracing::error!(error = %e, "Queue unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "QUEUE_UNAVAILABLE",
                        "The analysis queue is unavailable. Please retry later.".to_string(),
                    )
                }
                ExecuteError::Store(e) => classify_store(e),
            },

            ApiError::Store(err) => classify_store(err),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
