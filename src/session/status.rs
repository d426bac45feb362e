//! Recording session types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::calendar::AutoTaskConfig;
use crate::config::RealtimeConfig;

/// Lifecycle of one live recording session.
///
/// ```text
/// Idle -> Starting -> Recording -> [StopPendingConfirmation]* -> Stopping -> Stopped
///                 any state -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    StopPendingConfirmation,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::StopPendingConfirmation => "stop_pending_confirmation",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "recording" => Ok(Self::Recording),
            "stop_pending_confirmation" => Ok(Self::StopPendingConfirmation),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("Invalid session state: {}", s),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Holds (or is about to hold) a capture pipeline.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Recording | Self::StopPendingConfirmation | Self::Stopping
        )
    }

    pub fn is_stop_related(&self) -> bool {
        matches!(
            self,
            Self::StopPendingConfirmation | Self::Stopping | Self::Stopped
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the translation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationState {
    Active,
    Draining,
    Complete,
    Cancelled,
}

/// Effective pipeline options for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub enable_transcription: bool,
    pub enable_recording: bool,
    pub enable_translation: bool,
    pub target_language: Option<String>,
}

impl From<&RealtimeConfig> for SessionOptions {
    fn from(defaults: &RealtimeConfig) -> Self {
        Self {
            enable_transcription: defaults.enable_transcription,
            enable_recording: defaults.enable_recording,
            enable_translation: defaults.enable_translation,
            target_language: defaults.target_language.clone(),
        }
    }
}

impl SessionOptions {
    /// Defaults are the baseline; only the keys the event sets override them.
    pub fn merged_with(mut self, overrides: &AutoTaskConfig) -> Self {
        if let Some(value) = overrides.enable_transcription {
            self.enable_transcription = value;
        }
        if let Some(value) = overrides.enable_recording {
            self.enable_recording = value;
        }
        if let Some(value) = overrides.enable_translation {
            self.enable_translation = value;
        }
        if let Some(language) = &overrides.target_language {
            self.target_language = Some(language.clone());
        }
        self
    }

    /// Translation runs only when it is enabled and has somewhere to go.
    pub fn translation_target(&self) -> Option<&str> {
        if self.enable_translation {
            self.target_language.as_deref()
        } else {
            None
        }
    }
}

/// Who asked for the session to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub event_id: Option<String>,
    pub title: Option<String>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub options: SessionOptions,
}

impl StartRequest {
    pub fn manual(options: SessionOptions) -> Self {
        Self {
            event_id: None,
            title: None,
            scheduled_end: None,
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub label: String,
    /// Seconds since recording began.
    pub offset_secs: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedSegment {
    pub index: usize,
    pub text: String,
}

/// Files written when a session is archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub transcript_path: PathBuf,
    pub translation_path: Option<PathBuf>,
    pub markers_path: PathBuf,
}

/// Snapshot of a session as seen by the API and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: Uuid,
    pub event_id: Option<String>,
    pub title: Option<String>,
    pub state: SessionState,
    pub options: SessionOptions,
    pub started_at: Option<DateTime<Utc>>,
    /// Last-known end of the linked event; refreshed on every scheduler tick.
    pub scheduled_end: Option<DateTime<Utc>>,
    pub audio_duration_secs: f64,
    pub markers: Vec<Marker>,
    pub translation: Option<TranslationState>,
    pub stop_deferrals: u32,
    pub archive: Option<SessionArchive>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RecordingSession {
    pub fn new(request: &StartRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: request.event_id.clone(),
            title: request.title.clone(),
            state: SessionState::Idle,
            options: request.options.clone(),
            started_at: None,
            scheduled_end: request.scheduled_end,
            audio_duration_secs: 0.0,
            markers: Vec::new(),
            translation: None,
            stop_deferrals: 0,
            archive: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}
