//! Engine seams: capture, transcription and translation.
//!
//! The queue and the session controller only talk to these traits; the
//! concrete adapters shell out to local commands or call a remote jobs API.

pub mod capture;
pub mod processor;
pub mod remote;
pub mod translator;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{SessionError, TaskError};
use crate::queue::JobContext;
use crate::session::{SessionOptions, TranscriptSegment};

pub use capture::CommandCaptureEngine;
pub use processor::TranscriptionJobProcessor;
pub use remote::RemoteTranscriber;
pub use translator::CommandTranslator;

/// Transcript text plus its timed segments.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one audio file. Long waits go through `ctx` so the caller
    /// can cancel.
    async fn transcribe(&self, audio: &Path, ctx: &JobContext) -> Result<Transcript, TaskError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;
}

/// Live pipeline for one session.
pub struct CaptureHandle {
    /// Closed by the engine once the session is stopped.
    pub segments: mpsc::Receiver<TranscriptSegment>,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureSummary {
    pub audio_duration_secs: f64,
    /// Kept recording, if recording was enabled.
    pub audio_path: Option<PathBuf>,
}

/// Capture and streaming-transcription pipeline, keyed by session id so
/// several sessions can run side by side.
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    fn is_source_available(&self) -> bool;

    async fn start(
        &self,
        session_id: Uuid,
        options: &SessionOptions,
    ) -> Result<CaptureHandle, SessionError>;

    async fn add_marker(&self, session_id: Uuid, label: &str) -> Result<(), SessionError>;

    /// Seconds of audio captured so far, for engines that track it.
    async fn captured_duration(&self, _session_id: Uuid) -> Option<f64> {
        None
    }

    /// Push buffered audio through transcription now. Engines that hold no
    /// buffer between segments may treat this as a no-op.
    async fn flush(&self, session_id: Uuid) -> Result<(), SessionError>;

    /// Stop capturing. Every segment is sent before this returns.
    async fn stop(&self, session_id: Uuid) -> Result<CaptureSummary, SessionError>;
}
