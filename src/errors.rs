//! Typed error hierarchy for the analysis pipeline.
//!
//! One enum per subsystem:
//! - `QueueError`: work-queue claim/ack protocol failures
//! - `FetchError`: source snippet retrieval failures (per-frame)
//! - `EngineError`: analysis engine invocation failures
//! - `WorkflowError`: per-task workflow outcomes driving the retry
//!   state machine

use thiserror::Error;

/// Errors from the work-queue claim protocol.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Task {id} is not leased by worker {worker_id}")]
    LeaseLost { id: i64, worker_id: String },
}

/// Per-frame failures from the source repository fetcher.
///
/// All variants are absorbed locally by the workflow: a failed frame just
/// contributes no snippet.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("File {path} not found at {reference}")]
    NotFound { path: String, reference: String },

    #[error("Access denied fetching {path} (status {status})")]
    AccessDenied { path: String, status: u16 },

    #[error("Network error fetching {path}: {source}")]
    Network {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failures from the analysis engine call. All are treated as transient
/// and retried via the backoff state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine request failed: {0}")]
    Request(#[source] anyhow::Error),

    #[error("Engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Engine response carried no completion text")]
    EmptyCompletion,
}

/// Outcome classification for a single task attempt.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The attempt failed but the task should be redelivered.
    #[error("Retryable failure: {0}")]
    Retryable(#[source] anyhow::Error),

    /// The attempt exceeded its soft execution budget.
    #[error("Soft deadline of {budget_secs}s exceeded")]
    SoftDeadline { budget_secs: u64 },
}

impl From<EngineError> for WorkflowError {
    fn from(e: EngineError) -> Self {
        Self::Retryable(e.into())
    }
}
