use thiserror::Error;

use crate::cache::CacheError;
use crate::jobs::types::JobType;

#[derive(Debug, Error)]
pub enum JobError {
    /// Cancellation was requested and observed at a progress call
    #[error("Job was cancelled")]
    Cancelled,

    /// A FAIL policy escalated an error into an abort of the whole run
    #[error("Job was aborted: {0}")]
    Aborted(String),

    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("No job body registered for job type {0}")]
    NoJobBody(JobType),

    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub fn store(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        JobError::Store {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// True for the cooperative stop signals, as opposed to real failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

pub type JobResult<T> = Result<T, JobError>;
