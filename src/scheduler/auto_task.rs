//! Auto task scheduler.
//!
//! A single serialized loop that reconciles calendar events against the
//! clock on every tick:
//! reminder → auto-start → auto-stop request
//!
//! Each event is evaluated on its own; a failure is logged and the tick moves
//! on to the next event.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::trigger_memory::TriggerMemory;
use crate::calendar::{CalendarEvent, CalendarSource};
use crate::config::{RealtimeConfig, SchedulerConfig};
use crate::error::SessionError;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::session::{RecordingSession, SessionController, SessionOptions, SessionState, StartRequest};

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    ReminderFired {
        event_id: String,
        title: String,
        starts_at: DateTime<Utc>,
    },
    AutoStartDispatched {
        event_id: String,
        session_id: Uuid,
    },
    AutoStopRequested {
        event_id: String,
        session_id: Uuid,
    },
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub events_seen: usize,
    pub reminders: usize,
    pub starts: usize,
    pub stop_requests: usize,
    pub errors: usize,
}

pub struct AutoTaskScheduler {
    config: SchedulerConfig,
    defaults: RealtimeConfig,
    calendar: Arc<dyn CalendarSource>,
    sessions: SessionController,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    memory: TriggerMemory,
    events: broadcast::Sender<SchedulerEvent>,
}

impl AutoTaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        defaults: RealtimeConfig,
        calendar: Arc<dyn CalendarSource>,
        sessions: SessionController,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            defaults,
            calendar,
            sessions,
            notifier,
            clock,
            memory: TriggerMemory::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn trigger_memory(&self) -> &TriggerMemory {
        &self.memory
    }

    /// Tick until `shutdown` fires. A tick runs to completion before the next
    /// one is scheduled; late ticks are delayed, not bunched up.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let period = self.config.tick_interval();
        info!("Auto task scheduler running every {:?}", period);

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if summary != TickSummary::default() {
                        debug!("Scheduler tick: {:?}", summary);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Auto task scheduler stopped");
    }

    pub async fn tick(&mut self) -> TickSummary {
        let now = self.clock.now();
        self.tick_at(now).await
    }

    /// Evaluate every event in view at `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();
        let compensation = self.config.compensation();
        let window_start = now - self.config.stop_grace() - compensation;
        let window_end = now + self.config.reminder_lead() + compensation;

        let events = match self
            .calendar
            .list_events_in_window(window_start, window_end)
            .await
        {
            Ok(events) => Some(events),
            Err(e) => {
                error!("Calendar query failed: {:#}", e);
                summary.errors += 1;
                None
            }
        };

        if let Some(events) = &events {
            summary.events_seen = events.len();
            for event in events {
                if let Err(e) = self.evaluate_event(event, now, &mut summary).await {
                    summary.errors += 1;
                    warn!(
                        "Auto task for event {} ('{}') failed: {:#}",
                        event.id, event.title, e
                    );
                }
            }
        }

        if let Some(events) = &events {
            self.refresh_out_of_window_ends(events, &mut summary).await;
        }

        // Ends were refreshed above, so this sees the latest known values.
        let active = self.sessions.active_sessions().await;
        for session in &active {
            if let Err(e) = self.evaluate_stop(session, now, &mut summary).await {
                summary.errors += 1;
                warn!("Auto-stop check for session {} failed: {}", session.id, e);
            }
        }

        // Without a fresh event list there is nothing safe to forget.
        if let Some(events) = &events {
            let mut keep: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();
            keep.extend(active.iter().filter_map(|s| s.event_id.clone()));
            let forgotten = self.memory.retain_only(&keep);
            if forgotten > 0 {
                debug!("Forgot triggers for {} event(s) out of view", forgotten);
            }
        }

        summary
    }

    async fn evaluate_event(
        &mut self,
        event: &CalendarEvent,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let active = self.sessions.active_for_event(&event.id).await;
        if let Some(session) = &active {
            self.sessions.update_scheduled_end(session.id, event.end).await;
        }

        let Some(auto_task) = self.calendar.get_auto_task_config(&event.id).await? else {
            return Ok(());
        };

        let triggers = self.memory.get(&event.id);
        let compensation = self.config.compensation();

        if !triggers.reminder_fired {
            if in_reminder_window(event, now, self.config.reminder_lead()) {
                self.fire_reminder(event);
                self.memory.mark_reminder_fired(&event.id);
                summary.reminders += 1;
            } else if now >= event.start - compensation {
                // A reminder must never follow the start.
                debug!("Reminder window for event {} passed unobserved", event.id);
                self.memory.mark_reminder_fired(&event.id);
            }
        }

        if triggers.start_triggered || !in_start_window(event, now, compensation) {
            return Ok(());
        }

        if let Some(session) = &active {
            debug!(
                "Event {} already has session {}, not starting another",
                event.id, session.id
            );
            self.memory.mark_start_triggered(&event.id, Some(session.id));
            return Ok(());
        }

        let options = SessionOptions::from(&self.defaults).merged_with(&auto_task);
        // Marked before dispatch: a failed start is not retried every tick.
        self.memory.mark_start_triggered(&event.id, None);

        if !options.enable_recording && !options.enable_transcription {
            debug!("Auto task for event {} captures nothing, not starting", event.id);
            return Ok(());
        }

        let request = StartRequest {
            event_id: Some(event.id.clone()),
            title: Some(event.title.clone()),
            scheduled_end: Some(event.end),
            options,
        };

        match self.sessions.start_detached(request).await {
            Ok(session_id) => {
                info!(
                    "Auto-starting session {} for event {} ('{}')",
                    session_id, event.id, event.title
                );
                self.memory.mark_start_triggered(&event.id, Some(session_id));
                summary.starts += 1;
                let _ = self.events.send(SchedulerEvent::AutoStartDispatched {
                    event_id: event.id.clone(),
                    session_id,
                });
                Ok(())
            }
            Err(SessionError::AlreadyActive { session_id, .. }) => {
                debug!("Event {} already recording in session {}", event.id, session_id);
                self.memory.mark_start_triggered(&event.id, Some(session_id));
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Auto-start failed")),
        }
    }

    /// Sessions whose event moved so far back that it fell out of the query
    /// window still need the new end. A deleted event keeps the last-known end.
    async fn refresh_out_of_window_ends(
        &self,
        events: &[CalendarEvent],
        summary: &mut TickSummary,
    ) {
        let seen: HashSet<&str> = events.iter().map(|e| e.id.as_str()).collect();
        for session in self.sessions.active_sessions().await {
            let Some(event_id) = session.event_id.as_deref() else {
                continue;
            };
            if seen.contains(event_id) {
                continue;
            }

            match self.calendar.get_event(event_id).await {
                Ok(Some(event)) => {
                    self.sessions.update_scheduled_end(session.id, event.end).await;
                }
                Ok(None) => {
                    debug!(
                        "Event {} is gone, session {} keeps end {:?}",
                        event_id, session.id, session.scheduled_end
                    );
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!("Calendar lookup for event {} failed: {:#}", event_id, e);
                }
            }
        }
    }

    async fn evaluate_stop(
        &self,
        session: &RecordingSession,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<(), SessionError> {
        let (Some(event_id), Some(end)) = (&session.event_id, session.scheduled_end) else {
            return Ok(());
        };
        if session.state != SessionState::Recording || now < end + self.config.stop_grace() {
            return Ok(());
        }

        if self.sessions.request_stop(session.id).await? {
            info!(
                "Event {} ended at {}, asking to stop session {}",
                event_id, end, session.id
            );
            summary.stop_requests += 1;
            let _ = self.events.send(SchedulerEvent::AutoStopRequested {
                event_id: event_id.clone(),
                session_id: session.id,
            });
        }
        Ok(())
    }

    fn fire_reminder(&self, event: &CalendarEvent) {
        info!("Reminder for event {} ('{}')", event.id, event.title);
        let body = format!(
            "Starts at {}",
            event.start.with_timezone(&Local).format("%H:%M")
        );
        self.notifier.notify(
            Notification::new(NotificationKind::Reminder, event.title.clone(), body)
                .for_event(Some(&event.id)),
        );
        let _ = self.events.send(SchedulerEvent::ReminderFired {
            event_id: event.id.clone(),
            title: event.title.clone(),
            starts_at: event.start,
        });
    }
}

/// `[start - lead, start)`
fn in_reminder_window(event: &CalendarEvent, now: DateTime<Utc>, lead: chrono::Duration) -> bool {
    now >= event.start - lead && now < event.start
}

/// `[start - compensation, start + compensation]`
fn in_start_window(
    event: &CalendarEvent,
    now: DateTime<Utc>,
    compensation: chrono::Duration,
) -> bool {
    now >= event.start - compensation && now <= event.start + compensation
}
