use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{AutoTaskConfig, CalendarEvent, CalendarSource};

/// Calendar held in memory. Used when embedding the engine and in tests.
#[derive(Default)]
pub struct InMemoryCalendar {
    events: RwLock<HashMap<String, CalendarEvent>>,
    configs: RwLock<HashMap<String, AutoTaskConfig>>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_event(&self, event: CalendarEvent, config: Option<AutoTaskConfig>) {
        let id = event.id.clone();
        self.events.write().await.insert(id.clone(), event);
        let mut configs = self.configs.write().await;
        match config {
            Some(config) => {
                configs.insert(id, config);
            }
            None => {
                configs.remove(&id);
            }
        }
    }

    /// Move an event, as an external sync would.
    pub async fn reschedule(&self, event_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.events.write().await.get_mut(event_id) {
            Some(event) => {
                event.start = start;
                event.end = end;
                true
            }
            None => false,
        }
    }

    pub async fn remove_event(&self, event_id: &str) {
        self.events.write().await.remove(event_id);
        self.configs.write().await.remove(event_id);
    }
}

#[async_trait]
impl CalendarSource for InMemoryCalendar {
    async fn list_events_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let events = self.events.read().await;
        let mut found: Vec<CalendarEvent> = events
            .values()
            .filter(|event| event.overlaps(start, end))
            .cloned()
            .collect();
        found.sort_by_key(|event| event.start);
        Ok(found)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<CalendarEvent>> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn get_auto_task_config(&self, event_id: &str) -> Result<Option<AutoTaskConfig>> {
        Ok(self.configs.read().await.get(event_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(id: &str, start: DateTime<Utc>, minutes: i64) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: id.to_string(),
            start,
            end: start + Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn test_window_query_and_reschedule() {
        let calendar = InMemoryCalendar::new();
        let now = Utc::now();
        calendar
            .upsert_event(event("soon", now + Duration::minutes(10), 30), None)
            .await;
        calendar
            .upsert_event(event("later", now + Duration::hours(5), 30), None)
            .await;

        let found = calendar
            .list_events_in_window(now, now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "soon");

        assert!(
            calendar
                .reschedule("later", now + Duration::minutes(20), now + Duration::minutes(50))
                .await
        );
        let found = calendar
            .list_events_in_window(now, now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_config_removed_with_event() {
        let calendar = InMemoryCalendar::new();
        let now = Utc::now();
        let config = AutoTaskConfig {
            enable_recording: Some(true),
            ..Default::default()
        };
        calendar
            .upsert_event(event("e1", now, 30), Some(config.clone()))
            .await;
        assert_eq!(
            calendar.get_auto_task_config("e1").await.unwrap(),
            Some(config)
        );

        calendar.remove_event("e1").await;
        assert_eq!(calendar.get_auto_task_config("e1").await.unwrap(), None);
        assert_eq!(calendar.get_event("e1").await.unwrap(), None);
    }
}
