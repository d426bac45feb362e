use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::Transcriber;
use crate::error::TaskError;
use crate::queue::{JobContext, JobProcessor};

/// Audio and video containers the transcription API accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "m4a", "flac", "ogg", "opus", "mp4", "mkv", "webm", "avi", "mov",
];

/// Queue processor that sends each input file to a [`Transcriber`].
pub struct TranscriptionJobProcessor {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptionJobProcessor {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl JobProcessor for TranscriptionJobProcessor {
    fn validate(&self, input: &Path) -> Result<(), TaskError> {
        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext) => {}
            Some(ext) => {
                return Err(TaskError::Validation(format!(
                    "Unsupported input format '.{}' (supported: {})",
                    ext,
                    SUPPORTED_EXTENSIONS.join(", ")
                )))
            }
            None => {
                return Err(TaskError::Validation(format!(
                    "Input {:?} has no file extension",
                    input
                )))
            }
        }

        if !input.is_file() {
            return Err(TaskError::Validation(format!(
                "Input file not found: {:?}",
                input
            )));
        }
        Ok(())
    }

    async fn process(&self, input: &Path, ctx: &JobContext) -> Result<String, TaskError> {
        ctx.checkpoint()?;
        let transcript = self.transcriber.transcribe(input, ctx).await?;
        ctx.checkpoint()?;
        Ok(transcript.text)
    }
}
