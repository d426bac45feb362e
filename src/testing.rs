//! In-process fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::ApiState;
use crate::config::{QueueConfig, RealtimeConfig, SessionConfig};
use crate::engine::{CaptureEngine, CaptureHandle, CaptureSummary};
use crate::error::{SessionError, TaskError};
use crate::notify::ChannelNotifier;
use crate::queue::{JobContext, JobProcessor, TaskQueue};
use crate::session::{SessionController, SessionOptions, TranscriptSegment};

/// Accepts anything and echoes the input path back as the transcript.
pub struct AcceptAllProcessor;

#[async_trait]
impl JobProcessor for AcceptAllProcessor {
    fn validate(&self, _input: &Path) -> Result<(), TaskError> {
        Ok(())
    }

    async fn process(&self, input: &Path, ctx: &JobContext) -> Result<String, TaskError> {
        ctx.checkpoint()?;
        Ok(input.display().to_string())
    }
}

/// Emits one segment per session when it is stopped.
#[derive(Default)]
pub struct SilentCapture {
    live: Mutex<HashMap<Uuid, mpsc::Sender<TranscriptSegment>>>,
}

#[async_trait]
impl CaptureEngine for SilentCapture {
    fn is_source_available(&self) -> bool {
        true
    }

    async fn start(
        &self,
        session_id: Uuid,
        _options: &SessionOptions,
    ) -> Result<CaptureHandle, SessionError> {
        let (tx, rx) = mpsc::channel(16);
        self.live.lock().unwrap().insert(session_id, tx);
        Ok(CaptureHandle { segments: rx })
    }

    async fn add_marker(&self, _session_id: Uuid, _label: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn flush(&self, _session_id: Uuid) -> Result<(), SessionError> {
        Ok(())
    }

    async fn stop(&self, session_id: Uuid) -> Result<CaptureSummary, SessionError> {
        let tx = self.live.lock().unwrap().remove(&session_id);
        if let Some(tx) = tx {
            let _ = tx
                .send(TranscriptSegment {
                    index: 0,
                    start_secs: 0.0,
                    end_secs: 1.0,
                    text: "hello".to_string(),
                })
                .await;
        }
        Ok(CaptureSummary {
            audio_duration_secs: 1.0,
            audio_path: None,
        })
    }
}

pub fn api_state(dir: &Path) -> ApiState {
    let notifier = Arc::new(ChannelNotifier::new());
    let queue = TaskQueue::new(
        QueueConfig::default(),
        dir.join("transcripts"),
        Arc::new(AcceptAllProcessor),
        None,
    )
    .unwrap();
    let sessions = SessionController::new(
        SessionConfig::default(),
        dir.join("sessions"),
        Arc::new(SilentCapture::default()),
        None,
        notifier.clone(),
        None,
    )
    .unwrap();

    ApiState {
        queue,
        sessions,
        notifier,
        defaults: RealtimeConfig::default(),
    }
}
