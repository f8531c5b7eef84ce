//! REST API module.
//!
//! Auth, session-line and sync endpoints. Every response uses the `{status, message, data?}` envelope.

mod auth;
mod sync;
mod user;

pub use auth::*;
pub use sync::*;
pub use user::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::models::Status;

/// Success response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip)]
    pub code: StatusCode,
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(code: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            code,
            status: Status::Ok,
            message: message.into(),
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.code, Json(self)).into_response()
    }
}

/// Response type that can be either success or error.
pub type ApiResult<T> = Result<ApiResponse<T>, AppError>;

/// Create a successful API response.
pub fn success<T: Serialize>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok(ApiResponse::new(StatusCode::OK, message, Some(data)))
}

/// Create a `201 Created` API response.
pub fn created<T: Serialize>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok(ApiResponse::new(StatusCode::CREATED, message, Some(data)))
}

/// Create a successful API response without data.
pub fn done(message: impl Into<String>) -> ApiResult<()> {
    Ok(ApiResponse::new(StatusCode::OK, message, None))
}
