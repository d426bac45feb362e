//! Capture engine that records through an external command.
//!
//! The configured command writes a WAV file to `$AUTOSCRIBE_OUTPUT` until it
//! is interrupted. On stop the file is measured and transcribed in one pass.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CaptureEngine, CaptureHandle, CaptureSummary, Transcriber};
use crate::error::SessionError;
use crate::queue::JobContext;
use crate::session::{SessionOptions, TranscriptSegment};

/// Environment passed to the capture command.
pub mod capture_env {
    pub const OUTPUT: &str = "AUTOSCRIBE_OUTPUT";
    pub const SESSION_ID: &str = "AUTOSCRIBE_SESSION_ID";
}

const SEGMENT_BUFFER: usize = 64;
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

struct ActiveCapture {
    child: Child,
    audio_path: PathBuf,
    options: SessionOptions,
    segments: mpsc::Sender<TranscriptSegment>,
}

pub struct CommandCaptureEngine {
    command: String,
    sessions_dir: PathBuf,
    transcriber: Arc<dyn Transcriber>,
    active: Mutex<HashMap<Uuid, ActiveCapture>>,
}

impl CommandCaptureEngine {
    pub fn new(command: String, sessions_dir: PathBuf, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            command,
            sessions_dir,
            transcriber,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }

    async fn interrupt(child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };

        // SIGINT lets the recorder finalize the WAV header.
        let signalled = tokio::process::Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);

        if signalled {
            if let Ok(Ok(status)) = tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await {
                debug!("Capture process exited with {}", status);
                return;
            }
        }

        warn!("Capture process {} did not exit on interrupt, killing", pid);
        if let Err(e) = child.kill().await {
            warn!("Failed to kill capture process {}: {}", pid, e);
        }
    }
}

#[async_trait]
impl CaptureEngine for CommandCaptureEngine {
    fn is_source_available(&self) -> bool {
        match self.program() {
            Some(program) => which::which(program).is_ok(),
            None => false,
        }
    }

    async fn start(
        &self,
        session_id: Uuid,
        options: &SessionOptions,
    ) -> Result<CaptureHandle, SessionError> {
        let session_dir = self.sessions_dir.join(session_id.to_string());
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| SessionError::Engine(format!("Failed to create session dir: {e}")))?;
        let audio_path = session_dir.join("audio.wav");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(capture_env::OUTPUT, &audio_path)
            .env(capture_env::SESSION_ID, session_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Engine(format!("Failed to spawn capture command: {e}")))?;

        info!("Capture started for session {} -> {:?}", session_id, audio_path);

        let (tx, rx) = mpsc::channel(SEGMENT_BUFFER);
        self.active.lock().await.insert(
            session_id,
            ActiveCapture {
                child,
                audio_path,
                options: options.clone(),
                segments: tx,
            },
        );
        Ok(CaptureHandle { segments: rx })
    }

    async fn add_marker(&self, session_id: Uuid, label: &str) -> Result<(), SessionError> {
        if !self.active.lock().await.contains_key(&session_id) {
            return Err(SessionError::Engine(format!(
                "No capture running for session {session_id}"
            )));
        }
        debug!("Marker '{}' noted for session {}", label, session_id);
        Ok(())
    }

    async fn flush(&self, session_id: Uuid) -> Result<(), SessionError> {
        // The whole file is transcribed on stop, so nothing is buffered here.
        debug!("Flush requested for session {}", session_id);
        Ok(())
    }

    async fn stop(&self, session_id: Uuid) -> Result<CaptureSummary, SessionError> {
        let Some(mut capture) = self.active.lock().await.remove(&session_id) else {
            return Err(SessionError::Engine(format!(
                "No capture running for session {session_id}"
            )));
        };

        Self::interrupt(&mut capture.child).await;

        let audio_duration_secs = wav_duration_secs(&capture.audio_path).unwrap_or_else(|e| {
            warn!("Could not read {:?}: {}", capture.audio_path, e);
            0.0
        });
        info!(
            "Capture stopped for session {} ({:.1}s of audio)",
            session_id, audio_duration_secs
        );

        if capture.options.enable_transcription && audio_duration_secs > 0.0 {
            let ctx = JobContext::detached(CancellationToken::new());
            let transcript = self
                .transcriber
                .transcribe(&capture.audio_path, &ctx)
                .await
                .map_err(|e| SessionError::Engine(e.to_string()))?;

            for segment in transcript.segments {
                if capture.segments.send(segment).await.is_err() {
                    warn!("Segment receiver for session {} dropped", session_id);
                    break;
                }
            }
        }

        let audio_path = if capture.options.enable_recording {
            Some(capture.audio_path)
        } else {
            if let Err(e) = tokio::fs::remove_file(&capture.audio_path).await {
                debug!("No audio to discard for session {}: {}", session_id, e);
            }
            None
        };

        Ok(CaptureSummary {
            audio_duration_secs,
            audio_path,
        })
    }
}

fn wav_duration_secs(path: &Path) -> anyhow::Result<f64> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0.0);
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}
