//! Job errors
//!
//! `JobError` is what callers of the queue see. `ProcessingError` is what a
//! processor returns; its category decides between retry and dead-letter:
//! - **Transient**: retried until `maxAttempts`
//! - **Permanent**: failed and dead-lettered immediately

use amqp_worker::AmqpError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::{JobStatus, JobType};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Queue '{queue}' accepts {expected} jobs, got {actual}")]
    JobTypeMismatch {
        queue: String,
        expected: JobType,
        actual: JobType,
    },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    #[error("Job {job_id} is {status} and cannot transition")]
    TerminalState { job_id: String, status: JobStatus },

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },

    /// The job record exists but the message never reached the broker
    #[error("Failed to publish job {job_id}: {source}")]
    PublishFailure {
        job_id: String,
        #[source]
        source: AmqpError,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] AmqpError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn store(message: impl Into<String>) -> Self {
        JobError::Store(message.into())
    }

    fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            JobError::Validation(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            JobError::UnknownQueue(_) | JobError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            JobError::JobTypeMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "UnprocessableEntity")
            }
            JobError::DuplicateJob(_)
            | JobError::TerminalState { .. }
            | JobError::InvalidState { .. } => (StatusCode::CONFLICT, "Conflict"),
            JobError::PublishFailure { .. } | JobError::Broker(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable")
            }
            JobError::Store(_) | JobError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError")
            }
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Job request failed");
        } else {
            tracing::info!(error = %self, "Job request rejected");
        }
        let body = Json(json!({
            "error": error,
            "message": self.to_string(),
            "details": null,
        }));
        (status, body).into_response()
    }
}

impl From<mongodb::error::Error> for JobError {
    fn from(err: mongodb::error::Error) -> Self {
        JobError::Store(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for JobError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        JobError::Store(format!("bson encode: {}", err))
    }
}

impl From<mongodb::bson::de::Error> for JobError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        JobError::Store(format!("bson decode: {}", err))
    }
}

/// Category of processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure, retry while attempts remain
    Transient,
    /// Unrecoverable, dead-letter immediately
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Error returned by a job processor
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
    pub category: ErrorCategory,
}

impl ProcessingError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category == ErrorCategory::Permanent
    }
}

impl From<String> for ProcessingError {
    fn from(message: String) -> Self {
        ProcessingError::transient(message)
    }
}

impl From<&str> for ProcessingError {
    fn from(message: &str) -> Self {
        ProcessingError::transient(message)
    }
}

/// Payloads that do not deserialize will never succeed
impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::permanent(format!("invalid payload: {}", err))
    }
}

/// Store failures while a processor reports progress are worth retrying
impl From<JobError> for ProcessingError {
    fn from(err: JobError) -> Self {
        ProcessingError::transient(err.to_string())
    }
}
