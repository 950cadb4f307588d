use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use gather_core::error::AppError;

/// API error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, message) = match self {
            ApiError::NotFound(msg) => ("not_found", msg),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        if status.is_server_error() {
            tracing::error!(%status, %message, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::TaskNotFound(_) | AppError::JobNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            AppError::InvalidInput(_) | AppError::InvalidId(_) => {
                ApiError::BadRequest(err.to_string())
            }
            AppError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            AppError::StoreUnavailable(_) => {
                ApiError::ServiceUnavailable("Task store unavailable".to_string())
            }
            AppError::DatabaseError(_) => ApiError::Internal("Database error".to_string()),
            AppError::ConfigError(msg) => {
                ApiError::Internal(format!("Configuration error: {}", msg))
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
