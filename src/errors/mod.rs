//! Error types for the sync server and the device-side components.
//!
//! Server errors map to HTTP status codes and the `{status: "error"}` envelope.
//! Device-side errors are plain typed enums; the sync engine turns them into
//! counts and error lists rather than propagating them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::models::{Collection, Status};

/// Error codes as constants to avoid stringly-typed errors.
#[allow(dead_code)]
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// Server error type.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid access token
    Unauthorized(String),
    /// Token valid but not usable for this request (rotated, revoked)
    Forbidden(String),
    /// Resource not found
    NotFound(String),
    /// Validation error
    Validation(String),
    /// Database error
    Database(String),
    /// Internal server error
    Internal(String),
    /// Bad request
    BadRequest(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::Forbidden(_) => codes::FORBIDDEN,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
            AppError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::Forbidden(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Database(msg) => msg.clone(),
            AppError::Internal(msg) => msg.clone(),
            AppError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        tracing::error!("Password hashing error: {:?}", err);
        AppError::Internal("Password hashing failed".to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!("Blocking task failed: {:?}", err);
        AppError::Internal("Internal task failed".to_string())
    }
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: Status,
    pub message: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &AppError) -> Self {
        Self {
            status: Status::Error,
            message: error.message(),
            code: error.error_code().to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorResponse::new(&self))).into_response()
    }
}

// ==================== DEVICE-SIDE ERRORS ====================

/// Local store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store file error: {0}")]
    Io(#[from] std::io::Error),
}

/// A record that does not fit the upload or download shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid {} {uuid}: {}", .collection.noun(), .issues.join("; "))]
pub struct ValidationError {
    pub collection: Collection,
    pub uuid: String,
    pub issues: Vec<String>,
}

/// Failure of a request to the sync server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No usable response: connection failure or timeout.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The server answered with an error status.
    #[error("server answered {code}: {message}")]
    Status { code: u16, message: String },
    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ChannelError {
    /// Whether the server refused the credentials or the ownership of the request.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, ChannelError::Status { code: 401 | 403 | 404, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ChannelError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChannelError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ChannelError::Status {
                code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ChannelError::Unreachable(err.to_string())
        }
    }
}

/// Outcome of a session operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The server refused the refresh token; the device was signed out.
    #[error("Refresh failed. Could not login")]
    CouldNotLogin,
    /// The refresh token expired locally; the device was signed out.
    #[error("Session expired. Please login again")]
    SessionExpired,
    /// Credentials or registration data refused.
    #[error("{0}")]
    Rejected(String),
    #[error("Server unreachable: {0}")]
    Unreachable(String),
    #[error("Malformed server response: {0}")]
    Malformed(String),
    #[error("Not logged in")]
    NotAuthenticated,
    /// Network activity is switched off on this device.
    #[error("Offline mode")]
    Offline,
}

impl SessionError {
    /// Whether trying again later may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Unreachable(_) | SessionError::Malformed(_))
    }
}

/// Failure of an archive operation.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The deferred cascade already committed.
    #[error("undo window elapsed")]
    WindowElapsed,
    #[error("deferred cascade task failed: {0}")]
    Task(String),
}
