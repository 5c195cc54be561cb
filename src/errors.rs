use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the chat pipeline. Variants map to HTTP statuses via
/// `IntoResponse`; the WebSocket handler maps the same variants to close
/// codes or in-band `error` events.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after: f64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("storage failed: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ChatError::Internal(err.to_string())
    }

    pub fn generation<E: std::fmt::Display>(err: E) -> Self {
        ChatError::Generation(err.to_string())
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Store(err.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            ChatError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Invalid or expired token" }),
            ),
            ChatError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": msg })),
            ChatError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "Rate limit exceeded", "retry_after": retry_after }),
            ),
            ChatError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            // Whether a session exists under another account is not revealed.
            ChatError::Forbidden(_) => {
                (StatusCode::NOT_FOUND, json!({ "error": "Session not found" }))
            }
            ChatError::Generation(msg)
            | ChatError::Store(msg)
            | ChatError::Config(msg)
            | ChatError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };

        (status, Json(body)).into_response()
    }
}
