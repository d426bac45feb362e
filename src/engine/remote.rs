//! HTTP client for a transcription jobs API.
//!
//! Submits audio as multipart, then polls the lightweight status endpoint
//! until the remote job settles.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{Transcriber, Transcript};
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::queue::JobContext;
use crate::session::TranscriptSegment;

/// Remote job statuses.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: String,
    #[serde(default)]
    progress: u8,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job: RemoteJob,
}

#[derive(Debug, Deserialize)]
struct RemoteJob {
    result: Option<RemoteResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteResult {
    text: String,
    segments: Option<Vec<RemoteSegment>>,
}

#[derive(Debug, Deserialize)]
struct RemoteSegment {
    start: f64,
    end: f64,
    text: String,
}

pub struct RemoteTranscriber {
    client: reqwest::Client,
    base_url: String,
    language: Option<String>,
    poll_interval: Duration,
}

impl RemoteTranscriber {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_endpoint.trim_end_matches('/').to_string(),
            language: config.language.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    async fn submit(&self, file_path: &Path) -> Result<String, TaskError> {
        let file_data = tokio::fs::read(file_path)
            .await
            .map_err(|e| TaskError::Validation(format!("Cannot read {:?}: {}", file_path, e)))?;

        let filename = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let part = Part::bytes(file_data)
            .file_name(filename)
            .mime_str(mime_type(file_path))
            .map_err(|e| TaskError::Validation(e.to_string()))?;
        let mut form = Form::new().part("file", part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }
        form = form.text("timestamps", "true");

        let response = self
            .client
            .post(&self.base_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TaskError::TransientEngine(format!("Failed to submit job: {e}")))?;

        let body = checked_body(response, "Job submission").await?;
        let submitted: SubmitJobResponse = serde_json::from_str(&body).map_err(|e| {
            TaskError::TransientEngine(format!("Failed to parse job submission response: {e}"))
        })?;
        Ok(submitted.job_id)
    }

    async fn get_status(&self, remote_id: &str) -> Result<JobStatusResponse, TaskError> {
        let url = format!("{}/{}/status", self.base_url, remote_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TaskError::TransientEngine(format!("Failed to get job status: {e}")))?;

        let body = checked_body(response, "Status poll").await?;
        serde_json::from_str(&body)
            .map_err(|e| TaskError::TransientEngine(format!("Failed to parse status response: {e}")))
    }

    async fn get_job(&self, remote_id: &str) -> Result<RemoteJob, TaskError> {
        let url = format!("{}/{}", self.base_url, remote_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TaskError::TransientEngine(format!("Failed to get job: {e}")))?;

        let body = checked_body(response, "Job fetch").await?;
        let parsed: JobResponse = serde_json::from_str(&body)
            .map_err(|e| TaskError::TransientEngine(format!("Failed to parse job response: {e}")))?;
        Ok(parsed.job)
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(&self, audio: &Path, ctx: &JobContext) -> Result<Transcript, TaskError> {
        ctx.checkpoint()?;
        let remote_id = self.submit(audio).await?;
        info!("Job {} submitted as remote job {}", ctx.job_id(), remote_id);

        let mut last_status = String::new();
        loop {
            ctx.checkpoint()?;
            let job_status = self.get_status(&remote_id).await?;
            if job_status.status != last_status {
                debug!(
                    "Remote job {} status: {} ({}%)",
                    remote_id, job_status.status, job_status.progress
                );
                last_status = job_status.status.clone();
            }

            match job_status.status.as_str() {
                status::COMPLETED => {
                    let job = self.get_job(&remote_id).await?;
                    let result = job.result.ok_or_else(|| {
                        TaskError::TransientEngine("Job completed but no result available".into())
                    })?;
                    return Ok(into_transcript(result));
                }
                status::FAILED => {
                    let job = self.get_job(&remote_id).await?;
                    return Err(TaskError::TransientEngine(format!(
                        "Remote transcription failed: {}",
                        job.error.unwrap_or_else(|| "Unknown error".to_string())
                    )));
                }
                status::CANCELLED => {
                    return Err(TaskError::TransientEngine(
                        "Remote job was cancelled by the server".to_string(),
                    ))
                }
                _ => {
                    ctx.report_progress(job_status.progress).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                    }
                }
            }
        }
    }
}

async fn checked_body(response: reqwest::Response, what: &str) -> Result<String, TaskError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TaskError::TransientEngine(format!("{what} response unreadable: {e}")))?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(classify_failure(status, &format!("{what} failed ({status}): {body}")))
    }
}

/// The server rejected the request itself: retrying will not help. Throttling
/// and timeouts are the exception.
fn classify_failure(status: StatusCode, message: &str) -> TaskError {
    let retryable = !status.is_client_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    if retryable {
        TaskError::TransientEngine(message.to_string())
    } else {
        TaskError::Validation(message.to_string())
    }
}

fn into_transcript(result: RemoteResult) -> Transcript {
    let segments = match result.segments {
        Some(segments) => segments
            .into_iter()
            .enumerate()
            .map(|(index, s)| TranscriptSegment {
                index,
                start_secs: s.start,
                end_secs: s.end,
                text: s.text.trim().to_string(),
            })
            .collect(),
        None if !result.text.trim().is_empty() => vec![TranscriptSegment {
            index: 0,
            start_secs: 0.0,
            end_secs: 0.0,
            text: result.text.trim().to_string(),
        }],
        None => Vec::new(),
    };

    Transcript {
        text: result.text,
        segments,
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retried() {
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "bad"),
            TaskError::Validation(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "down"),
            TaskError::TransientEngine(_)
        ));
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow").is_retryable());
    }

    #[test]
    fn test_result_without_segments_becomes_one_segment() {
        let transcript = into_transcript(RemoteResult {
            text: " hello there ".to_string(),
            segments: None,
        });
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(transcript.segments[0].text, "hello there");
    }

    #[test]
    fn test_segments_are_indexed_in_order() {
        let transcript = into_transcript(RemoteResult {
            text: "a b".to_string(),
            segments: Some(vec![
                RemoteSegment {
                    start: 0.0,
                    end: 1.0,
                    text: "a".to_string(),
                },
                RemoteSegment {
                    start: 1.0,
                    end: 2.0,
                    text: "b".to_string(),
                },
            ]),
        });
        let indexes: Vec<usize> = transcript.segments.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn test_mime_type_lookup() {
        assert_eq!(mime_type(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(mime_type(Path::new("a.bin")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_unreadable_input_is_validation_error() {
        let transcriber = RemoteTranscriber::new(&EngineConfig::default());
        let ctx = JobContext::detached(tokio_util::sync::CancellationToken::new());
        let err = transcriber
            .transcribe(Path::new("/nonexistent/file.wav"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }
}
