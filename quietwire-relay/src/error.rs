//! API error type and its mapping onto stable HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quietwire_core::Error as CoreError;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// Domain failures with fixed taxonomy messages.
    Core(CoreError),
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    /// Double-submit check failed on a mutating request.
    Csrf,
    RateLimited,
    Database(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Core(e) => write!(f, "{}", e),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ApiError::Csrf => write!(f, "CSRF token missing or mismatched"),
            ApiError::RateLimited => write!(f, "Too many requests"),
            ApiError::Database(msg) => write!(f, "Database error: {}", msg),
            ApiError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(core) => match core {
                CoreError::InvalidCredentials
                | CoreError::InvalidToken
                | CoreError::RevokedToken
                | CoreError::InvalidSecondFactor
                | CoreError::ConnectionUnauthenticated => StatusCode::UNAUTHORIZED,
                CoreError::AccountNotActive(_)
                | CoreError::WrongTokenScope
                | CoreError::Forbidden => StatusCode::FORBIDDEN,
                CoreError::CannotTerminateCurrentSession => StatusCode::CONFLICT,
                CoreError::DecryptionFailed
                | CoreError::WeakPassword(_)
                | CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Csrf => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side faults keep their detail in the logs, not the body.
        let message = match &self {
            ApiError::Database(detail) => {
                tracing::error!("Database error: {}", detail);
                "Internal server error".to_string()
            }
            ApiError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
