//! Batch transcription queue.

pub mod context;
pub mod job;
pub mod task_queue;

pub use context::{JobContext, JobProcessor};
pub use job::{Job, JobEvent, JobStatus};
pub use task_queue::{CancelOutcome, TaskQueue};
