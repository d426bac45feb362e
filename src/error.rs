//! Error taxonomy shared by the task queue and the session controller.

use thiserror::Error;
use uuid::Uuid;

use crate::queue::JobStatus;
use crate::session::SessionState;

/// Outcome of a failed processing attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Bad input. Fatal, never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Engine hiccup. Retried with backoff up to the configured cap.
    #[error("Transcription engine error: {0}")]
    TransientEngine(String),

    /// Cancellation was observed at a checkpoint.
    #[error("Job was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientEngine(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Job {job_id} already used {retry_count} of {max_retries} retries")]
    RetryLimitReached {
        job_id: Uuid,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Job persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Capture source is not available")]
    CaptureUnavailable,

    /// Duplicate start for an event that already has a live session.
    #[error("Event {event_id} already has an active session ({session_id})")]
    AlreadyActive { event_id: String, session_id: Uuid },

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Cannot {action} session {session_id} while it is {state}")]
    InvalidState {
        session_id: Uuid,
        state: SessionState,
        action: &'static str,
    },

    #[error("Capture engine error: {0}")]
    Engine(String),

    #[error("Session persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}
