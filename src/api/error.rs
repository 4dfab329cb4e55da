use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Ambiguous identifier: {0}")]
    AmbiguousIdentifier(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Chunk hash mismatch: {0}")]
    ChunkHashMismatch(String),

    #[error("Overall hash mismatch: {0}")]
    OverallHashMismatch(String),

    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable".to_string())
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::AmbiguousIdentifier(msg) => (
                StatusCode::BAD_REQUEST,
                format!("Ambiguous identifier: {msg}"),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ChunkHashMismatch(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::OverallHashMismatch(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::StaleState(msg) => (StatusCode::CONFLICT, msg),
            AppError::StorageUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Unhandled error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
