//! Read-only calendar collaborators.
//!
//! The scheduler asks which events overlap a time window, looks up single
//! events it is already recording, and reads the auto-task configuration an
//! event carries.

pub mod json_file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use json_file::JsonFileCalendar;
pub use memory::InMemoryCalendar;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarEvent {
    /// Half-open overlap test against `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && self.end > start
    }
}

/// Per-event overrides of the global realtime defaults. Unset keys keep the
/// default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTaskConfig {
    pub enable_transcription: Option<bool>,
    pub enable_recording: Option<bool>,
    pub enable_translation: Option<bool>,
    pub target_language: Option<String>,
}

#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events overlapping `[start, end)`, in any order.
    async fn list_events_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>>;

    /// A single event regardless of when it runs. `None` once it is deleted.
    async fn get_event(&self, event_id: &str) -> Result<Option<CalendarEvent>>;

    async fn get_auto_task_config(&self, event_id: &str) -> Result<Option<AutoTaskConfig>>;
}
