//! Error types for the batch conversion service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::{JobId, TaskId};

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors surfaced to callers.
///
/// Task-level conversion failures never appear here; they are recorded on the
/// task itself (see [`crate::conversion::ConversionError`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected batch input (bad options, counts, sizes)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested target format or upload type is not supported
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Admission ceiling reached
    #[error("Too many active jobs (limit {limit})")]
    Capacity { limit: usize },

    /// Working area allocation or reclamation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown or expired job id
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Unknown task id within a known job
    #[error("Task {task_id} not found in job {job_id}")]
    TaskNotFound { job_id: JobId, task_id: TaskId },

    /// Operation not allowed in the job's or task's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            Error::UnsupportedFormat(fmt) => (
                StatusCode::BAD_REQUEST,
                "unsupported_format",
                format!("Unsupported format: {}", fmt),
            ),
            Error::Capacity { limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                "capacity_exceeded",
                format!("Too many active jobs (limit {}), try again later", limit),
            ),
            Error::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg.clone()),
            Error::JobNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Job not found: {}", id),
            ),
            Error::TaskNotFound { job_id, task_id } => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Task {} not found in job {}", task_id, job_id),
            ),
            Error::InvalidState(msg) => (StatusCode::CONFLICT, "invalid_state", msg.clone()),
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
