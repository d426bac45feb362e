//! Per-event record of what the scheduler already did.
//!
//! Flags are set explicitly when an action happens and are never derived
//! from timestamps, so polling drift and skipped ticks cannot re-fire them.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTriggers {
    pub reminder_fired: bool,
    pub start_triggered: bool,
    /// Session dispatched for the event, if any.
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Default)]
pub struct TriggerMemory {
    entries: HashMap<String, EventTriggers>,
}

impl TriggerMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> EventTriggers {
        self.entries.get(event_id).copied().unwrap_or_default()
    }

    pub fn mark_reminder_fired(&mut self, event_id: &str) {
        self.entry(event_id).reminder_fired = true;
    }

    pub fn mark_start_triggered(&mut self, event_id: &str, session_id: Option<Uuid>) {
        let entry = self.entry(event_id);
        entry.start_triggered = true;
        if session_id.is_some() {
            entry.session_id = session_id;
        }
    }

    /// Forget events that are neither in view nor tied to a live session.
    pub fn retain_only(&mut self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|event_id, _| keep.contains(event_id));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, event_id: &str) -> &mut EventTriggers {
        self.entries.entry(event_id.to_string()).or_default()
    }
}
