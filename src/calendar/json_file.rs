//! Calendar backed by a JSON file that an external sync tool keeps current.
//!
//! ```json
//! { "events": [ { "id": "abc", "title": "Standup",
//!                 "start": "2025-01-06T09:00:00Z", "end": "2025-01-06T09:15:00Z",
//!                 "auto_task": { "enable_recording": true } } ] }
//! ```
//!
//! The file is re-read on every call so out-of-band edits show up on the
//! next scheduler tick.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use super::{AutoTaskConfig, CalendarEvent, CalendarSource};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    events: Vec<FileEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEvent {
    #[serde(flatten)]
    event: CalendarEvent,
    #[serde(default)]
    auto_task: Option<AutoTaskConfig>,
}

pub struct JsonFileCalendar {
    path: PathBuf,
}

impl JsonFileCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<CalendarFile> {
        if !self.path.exists() {
            debug!("Calendar file {:?} not found, no events", self.path);
            return Ok(CalendarFile::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read calendar file {:?}", self.path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse calendar file {:?}", self.path))
    }
}

#[async_trait]
impl CalendarSource for JsonFileCalendar {
    async fn list_events_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let file = self.load().await?;
        Ok(file
            .events
            .into_iter()
            .map(|entry| entry.event)
            .filter(|event| event.overlaps(start, end))
            .collect())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<CalendarEvent>> {
        let file = self.load().await?;
        Ok(file
            .events
            .into_iter()
            .map(|entry| entry.event)
            .find(|event| event.id == event_id))
    }

    async fn get_auto_task_config(&self, event_id: &str) -> Result<Option<AutoTaskConfig>> {
        let file = self.load().await?;
        Ok(file
            .events
            .into_iter()
            .find(|entry| entry.event.id == event_id)
            .and_then(|entry| entry.auto_task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"{
        "events": [
            {
                "id": "standup",
                "title": "Standup",
                "start": "2025-01-06T09:00:00Z",
                "end": "2025-01-06T09:15:00Z",
                "auto_task": { "enable_recording": true, "target_language": "es" }
            },
            {
                "id": "lunch",
                "title": "Lunch",
                "start": "2025-01-06T12:00:00Z",
                "end": "2025-01-06T13:00:00Z"
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_reads_events_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let calendar = JsonFileCalendar::new(&path);

        let morning = Utc.with_ymd_and_hms(2025, 1, 6, 8, 55, 0).unwrap();
        let events = calendar
            .list_events_in_window(morning, morning + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Standup");

        let config = calendar.get_auto_task_config("standup").await.unwrap().unwrap();
        assert_eq!(config.enable_recording, Some(true));
        assert_eq!(config.target_language.as_deref(), Some("es"));
        assert!(calendar.get_auto_task_config("lunch").await.unwrap().is_none());

        let lunch = calendar.get_event("lunch").await.unwrap().unwrap();
        assert_eq!(lunch.end, Utc.with_ymd_and_hms(2025, 1, 6, 13, 0, 0).unwrap());
        assert!(calendar.get_event("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = JsonFileCalendar::new(dir.path().join("absent.json"));
        let now = Utc::now();
        let events = calendar
            .list_events_in_window(now, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, "{ not json").unwrap();
        let calendar = JsonFileCalendar::new(&path);
        assert!(calendar.get_auto_task_config("x").await.is_err());
    }
}
