//! Error handling module for the fieldsync engine.
//!
//! Provides centralized error types with mapping to HTTP status codes and response envelopes.
//! Nothing in this taxonomy is allowed to terminate the process: transport failures degrade
//! to a stale cache, malformed records are skipped, tenant mismatches are discarded.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
    pub const MALFORMED_RECORD: &str = "MALFORMED_RECORD";
    pub const TENANT_MISMATCH: &str = "TENANT_MISMATCH";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
}

/// Application error type.
///
/// Store-inconsistency and superseded-event conditions are not errors: they
/// are counted in [`crate::diagnostics::Diagnostics`] and computation proceeds.
#[derive(Debug)]
pub enum AppError {
    /// Change stream or refresh transport failure (recovered via resubscribe + refresh)
    Transport(String),
    /// Row missing a required field or carrying an unparseable value
    MalformedRecord(String),
    /// Refresh or event tagged with a tenant other than the active one
    TenantMismatch(String),
    /// Resource not found
    NotFound(String),
    /// Validation error on a request
    Validation(String),
    /// Database error
    Database(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::MalformedRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::TenantMismatch(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Transport(_) => codes::TRANSPORT_ERROR,
            AppError::MalformedRecord(_) => codes::MALFORMED_RECORD,
            AppError::TenantMismatch(_) => codes::TENANT_MISMATCH,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Database(_) => codes::DATABASE_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Transport(msg)
            | AppError::MalformedRecord(msg)
            | AppError::TenantMismatch(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Database(msg) => msg.clone(),
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
        AppError::MalformedRecord(format!("JSON error: {}", err))
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
    pub revision_id: i64,
}

impl ErrorResponse {
    pub fn new(error: &AppError, revision_id: i64) -> Self {
        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
            },
            revision_id,
        }
    }
}

/// Wrapper type for errors that carry revision_id context.
pub struct AppErrorWithRevision {
    pub error: AppError,
    pub revision_id: i64,
}

impl IntoResponse for AppErrorWithRevision {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = ErrorResponse::new(&self.error, self.revision_id);
        (status, Json(body)).into_response()
    }
}
