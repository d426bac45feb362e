//! Processor seam for the task queue.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;

/// Turns one job input into transcript text.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Cheap input check run at enqueue time. A failure here fails the job
    /// without ever dispatching it.
    fn validate(&self, input: &Path) -> Result<(), TaskError>;

    /// Process the input. Implementations must call [`JobContext::checkpoint`]
    /// between units of work so cancellation is observed promptly.
    async fn process(&self, input: &Path, ctx: &JobContext) -> Result<String, TaskError>;
}

#[async_trait]
pub(crate) trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: Uuid, progress: u8);
}

/// Per-attempt handle given to a [`JobProcessor`].
#[derive(Clone)]
pub struct JobContext {
    job_id: Uuid,
    cancel: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl JobContext {
    pub(crate) fn new(job_id: Uuid, cancel: CancellationToken, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id,
            cancel,
            sink: Some(sink),
        }
    }

    /// A context not attached to any queue; progress reports are dropped.
    pub fn detached(cancel: CancellationToken) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            cancel,
            sink: None,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Err(TaskError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the job is cancelled. Useful inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn report_progress(&self, progress: u8) {
        if let Some(sink) = &self.sink {
            sink.report(self.job_id, progress.min(100)).await;
        }
    }
}
