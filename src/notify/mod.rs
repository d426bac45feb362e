//! Notification seam between the engine and whatever presents it to a user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

const NOTIFICATION_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Reminder,
    SessionStarted,
    SessionStopped,
    SessionFailed,
    StopConfirmation,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub event_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            event_id: None,
            session_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_event(mut self, event_id: Option<&str>) -> Self {
        self.event_id = event_id.map(str::to_string);
        self
    }

    pub fn for_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Answer to a scheduled stop prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StopDecision {
    #[serde(rename = "stop")]
    StopNow,
    Delay { minutes: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StopConfirmationRequest {
    pub session_id: Uuid,
    pub event_id: Option<String>,
    pub title: Option<String>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub default_delay_minutes: u64,
    /// How many times this session's stop has already been deferred.
    pub deferrals: u32,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire-and-forget. Must not block the caller.
    fn notify(&self, notification: Notification);

    /// Ask whether a session should stop now or later. May wait indefinitely.
    async fn request_stop_confirmation(&self, request: StopConfirmationRequest) -> StopDecision;

    /// The prompt for `session_id` no longer applies.
    fn withdraw_stop_confirmation(&self, _session_id: Uuid) {}
}

struct PendingConfirmation {
    request: StopConfirmationRequest,
    reply: oneshot::Sender<StopDecision>,
}

/// Broadcasts notifications and parks stop prompts until someone answers
/// them, e.g. through the HTTP API.
pub struct ChannelNotifier {
    events: broadcast::Sender<Notification>,
    pending: Mutex<HashMap<Uuid, PendingConfirmation>>,
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Stop prompts still waiting for an answer.
    pub fn pending(&self) -> Vec<StopConfirmationRequest> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut requests: Vec<_> = pending.values().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.scheduled_end);
        requests
    }

    /// Answer the prompt for `session_id`. Returns false when nothing is
    /// waiting.
    pub fn answer(&self, session_id: Uuid, decision: StopDecision) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);

        match entry {
            Some(pending) => {
                info!("Stop prompt for session {} answered: {:?}", session_id, decision);
                pending.reply.send(decision).is_ok()
            }
            None => false,
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        debug!("Notification: {:?} {}", notification.kind, notification.title);
        let _ = self.events.send(notification);
    }

    async fn request_stop_confirmation(&self, request: StopConfirmationRequest) -> StopDecision {
        let session_id = request.session_id;
        let fallback = StopDecision::Delay {
            minutes: request.default_delay_minutes,
        };

        let (reply, answer) = oneshot::channel();
        let title = request.title.clone().unwrap_or_else(|| "Recording".to_string());
        let body = match request.scheduled_end {
            Some(end) => format!("Scheduled end was {}. Stop recording?", end.format("%H:%M")),
            None => "Stop recording?".to_string(),
        };
        let notification = Notification::new(NotificationKind::StopConfirmation, title, body)
            .for_event(request.event_id.as_deref())
            .for_session(session_id);

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, PendingConfirmation { request, reply });
        self.notify(notification);

        // A withdrawn or replaced prompt never force-stops; the caller re-asks.
        answer.await.unwrap_or(fallback)
    }

    fn withdraw_stop_confirmation(&self, session_id: Uuid) {
        if self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id)
            .is_some()
        {
            debug!("Withdrew stop prompt for session {}", session_id);
        }
    }
}
