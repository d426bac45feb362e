//! Recording session controller.
//!
//! Owns every live session from start to archive:
//! start → record → [stop prompt]* → stop → drain → archive
//!
//! Sessions never share pipeline state. Each one gets its own capture handle,
//! segment forwarder and translation stage, so two overlapping meetings can
//! record side by side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::archive::write_archive;
use super::status::{
    Marker, RecordingSession, SessionState, StartRequest, StopReason, TranscriptSegment,
    TranslationState,
};
use super::translation::TranslationStage;
use crate::config::SessionConfig;
use crate::db::{Database, SessionRepository};
use crate::engine::{CaptureEngine, Translator};
use crate::error::SessionError;
use crate::notify::{
    Notification, NotificationKind, Notifier, StopConfirmationRequest, StopDecision,
};

const EVENT_CAPACITY: usize = 128;

/// Published on every session lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: Uuid,
        event_id: Option<String>,
    },
    StopRequested {
        session_id: Uuid,
        event_id: Option<String>,
    },
    Stopped {
        session_id: Uuid,
        event_id: Option<String>,
        reason: StopReason,
    },
    Failed {
        session_id: Uuid,
        event_id: Option<String>,
        error: String,
    },
}

#[derive(Default)]
struct PipelineOutput {
    transcript: Vec<TranscriptSegment>,
    translation: Option<TranslationStage>,
}

struct Pipeline {
    closing: CancellationToken,
    forwarder: JoinHandle<PipelineOutput>,
}

struct SessionEntry {
    session: RecordingSession,
    started: Option<Instant>,
    pipeline: Option<Pipeline>,
    /// Set while a scheduled-stop prompt loop is armed.
    confirmation: Option<CancellationToken>,
}

struct Inner {
    config: SessionConfig,
    sessions_dir: PathBuf,
    engine: Arc<dyn CaptureEngine>,
    translator: Option<Arc<dyn Translator>>,
    notifier: Arc<dyn Notifier>,
    db: Option<Database>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

enum AfterDelay {
    Reprompt,
    ForceStop(Option<Pipeline>),
}

impl SessionController {
    /// Sessions left live by a previous process are marked failed.
    pub fn new(
        config: SessionConfig,
        sessions_dir: PathBuf,
        engine: Arc<dyn CaptureEngine>,
        translator: Option<Arc<dyn Translator>>,
        notifier: Arc<dyn Notifier>,
        db: Option<Database>,
    ) -> Result<Self, SessionError> {
        if let Some(db) = &db {
            let reconciled = SessionRepository::fail_unfinished(&*db.conn()?)?;
            if reconciled > 0 {
                warn!("Marked {} interrupted session(s) as failed", reconciled);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                sessions_dir,
                engine,
                translator,
                notifier,
                db,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start a session and wait for the capture pipeline to open.
    pub async fn start(&self, request: StartRequest) -> Result<RecordingSession, SessionError> {
        let session_id = self.inner.register(&request).await?;
        Arc::clone(&self.inner).open(session_id).await
    }

    /// Register a session and open its pipeline in the background. The
    /// session is `Starting` when this returns.
    pub async fn start_detached(&self, request: StartRequest) -> Result<Uuid, SessionError> {
        let session_id = self.inner.register(&request).await?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Failures are recorded on the session by `open`.
            let _ = inner.open(session_id).await;
        });
        Ok(session_id)
    }

    /// User-initiated stop. Short sessions flush buffered audio first.
    pub async fn stop(&self, session_id: Uuid) -> Result<RecordingSession, SessionError> {
        let captured = self.inner.engine.captured_duration(session_id).await;
        let (pipeline, flush) = {
            let mut sessions = self.inner.sessions.lock().await;
            if !sessions.contains_key(&session_id) {
                drop(sessions);
                let stored = self.inner.load(session_id)?;
                return if stored.state.is_terminal() {
                    Ok(stored)
                } else {
                    Err(SessionError::NotFound(session_id))
                };
            }
            let entry = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;

            match entry.session.state {
                SessionState::Recording | SessionState::StopPendingConfirmation => {}
                SessionState::Stopping | SessionState::Stopped | SessionState::Failed => {
                    debug!(
                        "Stop for session {} ignored, already {}",
                        session_id, entry.session.state
                    );
                    return Ok(entry.session.clone());
                }
                state => {
                    return Err(SessionError::InvalidState {
                        session_id,
                        state,
                        action: "stop",
                    })
                }
            }

            if let Some(token) = entry.confirmation.take() {
                token.cancel();
                self.inner.notifier.withdraw_stop_confirmation(session_id);
            }

            let threshold = self.inner.config.min_flush_duration();
            // Wall-clock time stands in when the engine does not count audio.
            let flush = match captured {
                Some(secs) => secs < threshold.as_secs_f64(),
                None => entry.started.map_or(true, |t| t.elapsed() < threshold),
            };
            entry.session.state = SessionState::Stopping;
            self.inner.persist(&entry.session);
            (entry.pipeline.take(), flush)
        };

        info!("Session {} stopping (manual)", session_id);
        self.inner
            .finalize(session_id, pipeline, flush, StopReason::Manual)
            .await
    }

    /// Scheduled stop: prompts instead of stopping. Returns false when the
    /// session is not recording or a prompt is already armed.
    pub async fn request_stop(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let token = CancellationToken::new();
        let event_id = {
            let mut sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;

            if entry.session.state != SessionState::Recording || entry.confirmation.is_some() {
                debug!(
                    "Stop request for session {} ignored ({}, prompt armed: {})",
                    session_id,
                    entry.session.state,
                    entry.confirmation.is_some()
                );
                return Ok(false);
            }

            entry.confirmation = Some(token.clone());
            entry.session.state = SessionState::StopPendingConfirmation;
            self.inner.persist(&entry.session);
            entry.session.event_id.clone()
        };

        info!("Session {} awaiting stop confirmation", session_id);
        self.inner.publish(SessionEvent::StopRequested {
            session_id,
            event_id,
        });
        tokio::spawn(Arc::clone(&self.inner).confirm_stop(session_id, token));
        Ok(true)
    }

    pub async fn add_marker(
        &self,
        session_id: Uuid,
        label: impl Into<String>,
    ) -> Result<Marker, SessionError> {
        let label = label.into();
        let offset_secs = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            ensure_capturing(entry, "add a marker to")?;
            entry.started.map_or(0.0, |t| t.elapsed().as_secs_f64())
        };

        self.inner.engine.add_marker(session_id, &label).await?;

        let marker = Marker {
            label,
            offset_secs,
            created_at: Utc::now(),
        };
        let mut sessions = self.inner.sessions.lock().await;
        let entry = sessions
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        ensure_capturing(entry, "add a marker to")?;
        entry.session.markers.push(marker.clone());
        self.inner.persist(&entry.session);

        info!(
            "Marker '{}' added to session {} at {:.1}s",
            marker.label, session_id, marker.offset_secs
        );
        Ok(marker)
    }

    /// Record the latest known end of the session's event.
    pub async fn update_scheduled_end(&self, session_id: Uuid, end: DateTime<Utc>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&session_id) else {
            return false;
        };
        if entry.session.scheduled_end == Some(end) {
            return false;
        }

        info!(
            "Session {} scheduled end moved from {:?} to {}",
            session_id, entry.session.scheduled_end, end
        );
        entry.session.scheduled_end = Some(end);
        self.inner.persist(&entry.session);
        true
    }

    pub async fn get(&self, session_id: Uuid) -> Result<RecordingSession, SessionError> {
        if let Some(entry) = self.inner.sessions.lock().await.get(&session_id) {
            return Ok(entry.session.clone());
        }
        self.inner.load(session_id)
    }

    /// Sessions seen by this process, oldest first.
    pub async fn list(&self) -> Vec<RecordingSession> {
        let sessions = self.inner.sessions.lock().await;
        let mut list: Vec<RecordingSession> =
            sessions.values().map(|e| e.session.clone()).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub async fn active_sessions(&self) -> Vec<RecordingSession> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.state.is_active())
            .collect()
    }

    pub async fn active_for_event(&self, event_id: &str) -> Option<RecordingSession> {
        self.inner
            .sessions
            .lock()
            .await
            .values()
            .find(|e| e.session.event_id.as_deref() == Some(event_id) && e.session.state.is_active())
            .map(|e| e.session.clone())
    }

    /// Stop everything still capturing, e.g. on shutdown.
    pub async fn stop_all(&self) {
        let live: Vec<Uuid> = self
            .list()
            .await
            .into_iter()
            .filter(|s| {
                matches!(
                    s.state,
                    SessionState::Recording | SessionState::StopPendingConfirmation
                )
            })
            .map(|s| s.id)
            .collect();

        for session_id in live {
            if let Err(e) = self.stop(session_id).await {
                error!("Failed to stop session {}: {}", session_id, e);
            }
        }
    }
}

fn ensure_capturing(entry: &SessionEntry, action: &'static str) -> Result<(), SessionError> {
    match entry.session.state {
        SessionState::Recording | SessionState::StopPendingConfirmation => Ok(()),
        state => Err(SessionError::InvalidState {
            session_id: entry.session.id,
            state,
            action,
        }),
    }
}

impl Inner {
    async fn register(&self, request: &StartRequest) -> Result<Uuid, SessionError> {
        if !self.engine.is_source_available() {
            warn!("Capture source unavailable, refusing to start");
            return Err(SessionError::CaptureUnavailable);
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(event_id) = &request.event_id {
            let existing = sessions.values().find(|e| {
                e.session.event_id.as_deref() == Some(event_id.as_str())
                    && e.session.state.is_active()
            });
            if let Some(existing) = existing {
                debug!(
                    "Duplicate start for event {} rejected, session {} is {}",
                    event_id, existing.session.id, existing.session.state
                );
                return Err(SessionError::AlreadyActive {
                    event_id: event_id.clone(),
                    session_id: existing.session.id,
                });
            }
        }

        let mut session = RecordingSession::new(request);
        session.state = SessionState::Starting;
        self.persist(&session);

        let session_id = session.id;
        match &session.event_id {
            Some(event_id) => info!("Session {} starting for event {}", session_id, event_id),
            None => info!("Session {} starting", session_id),
        }
        sessions.insert(
            session_id,
            SessionEntry {
                session,
                started: None,
                pipeline: None,
                confirmation: None,
            },
        );
        Ok(session_id)
    }

    async fn open(self: Arc<Self>, session_id: Uuid) -> Result<RecordingSession, SessionError> {
        let options = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            entry.session.options.clone()
        };

        let handle = match self.engine.start(session_id, &options).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Session {} failed to start: {}", session_id, e);
                self.fail(session_id, e.to_string()).await;
                return Err(e);
            }
        };

        let translation = match (options.translation_target(), &self.translator) {
            (Some(language), Some(translator)) => Some(TranslationStage::spawn(
                session_id,
                Arc::clone(translator),
                language.to_string(),
            )),
            (Some(_), None) => {
                warn!(
                    "Session {} asked for translation but no translator is configured",
                    session_id
                );
                None
            }
            (None, _) => None,
        };
        let translating = translation.is_some();

        let closing = CancellationToken::new();
        let forwarder = tokio::spawn(forward_segments(
            session_id,
            handle.segments,
            translation,
            closing.clone(),
        ));

        let snapshot = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            entry.session.state = SessionState::Recording;
            entry.session.started_at = Some(Utc::now());
            entry.session.translation = translating.then_some(TranslationState::Active);
            entry.started = Some(Instant::now());
            entry.pipeline = Some(Pipeline { closing, forwarder });
            self.persist(&entry.session);
            entry.session.clone()
        };

        info!("Session {} recording", session_id);
        self.publish(SessionEvent::Started {
            session_id,
            event_id: snapshot.event_id.clone(),
        });
        self.notifier.notify(
            Notification::new(
                NotificationKind::SessionStarted,
                "Recording started",
                snapshot.title.clone().unwrap_or_else(|| "Manual session".to_string()),
            )
            .for_event(snapshot.event_id.as_deref())
            .for_session(session_id),
        );
        Ok(snapshot)
    }

    /// Prompt loop for a scheduled stop. Runs until the user confirms, the
    /// deferral cap forces the stop, or a manual stop cancels `token`.
    async fn confirm_stop(self: Arc<Self>, session_id: Uuid, token: CancellationToken) {
        loop {
            let request = {
                let sessions = self.sessions.lock().await;
                let Some(entry) = sessions.get(&session_id) else {
                    return;
                };
                if token.is_cancelled()
                    || entry.session.state != SessionState::StopPendingConfirmation
                {
                    return;
                }
                StopConfirmationRequest {
                    session_id,
                    event_id: entry.session.event_id.clone(),
                    title: entry.session.title.clone(),
                    scheduled_end: entry.session.scheduled_end,
                    default_delay_minutes: self.config.stop_confirmation_delay_minutes,
                    deferrals: entry.session.stop_deferrals,
                }
            };

            let decision = tokio::select! {
                _ = token.cancelled() => return,
                decision = self.notifier.request_stop_confirmation(request) => decision,
            };

            let minutes = match decision {
                StopDecision::StopNow => {
                    let pipeline = {
                        let mut sessions = self.sessions.lock().await;
                        let Some(entry) = sessions.get_mut(&session_id) else {
                            return;
                        };
                        if token.is_cancelled()
                            || entry.session.state != SessionState::StopPendingConfirmation
                        {
                            return;
                        }
                        entry.confirmation = None;
                        entry.session.state = SessionState::Stopping;
                        self.persist(&entry.session);
                        entry.pipeline.take()
                    };

                    info!("Session {} stop confirmed", session_id);
                    if let Err(e) = self
                        .finalize(session_id, pipeline, false, StopReason::Scheduled)
                        .await
                    {
                        error!("Scheduled stop of session {} failed: {}", session_id, e);
                    }
                    return;
                }
                StopDecision::Delay { minutes } => minutes.max(1),
            };

            let deferrals = {
                let mut sessions = self.sessions.lock().await;
                let Some(entry) = sessions.get_mut(&session_id) else {
                    return;
                };
                if token.is_cancelled()
                    || entry.session.state != SessionState::StopPendingConfirmation
                {
                    return;
                }
                entry.session.stop_deferrals += 1;
                entry.session.state = SessionState::Recording;
                self.persist(&entry.session);
                entry.session.stop_deferrals
            };
            info!(
                "Session {} stop deferred {} minute(s) (deferral {})",
                session_id, minutes, deferrals
            );

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
            }

            let force = self
                .config
                .max_stop_deferrals
                .map_or(false, |cap| deferrals >= cap);

            let next = {
                let mut sessions = self.sessions.lock().await;
                let Some(entry) = sessions.get_mut(&session_id) else {
                    return;
                };
                if token.is_cancelled() || entry.session.state != SessionState::Recording {
                    return;
                }
                if force {
                    entry.confirmation = None;
                    entry.session.state = SessionState::Stopping;
                    self.persist(&entry.session);
                    AfterDelay::ForceStop(entry.pipeline.take())
                } else {
                    entry.session.state = SessionState::StopPendingConfirmation;
                    self.persist(&entry.session);
                    self.publish(SessionEvent::StopRequested {
                        session_id,
                        event_id: entry.session.event_id.clone(),
                    });
                    AfterDelay::Reprompt
                }
            };

            if let AfterDelay::ForceStop(pipeline) = next {
                warn!(
                    "Session {} reached {} stop deferral(s), stopping",
                    session_id, deferrals
                );
                if let Err(e) = self
                    .finalize(session_id, pipeline, false, StopReason::Scheduled)
                    .await
                {
                    error!("Forced stop of session {} failed: {}", session_id, e);
                }
                return;
            }
        }
    }

    /// Stop capture, collect segments, drain translation, archive. The
    /// session must already be `Stopping`.
    async fn finalize(
        &self,
        session_id: Uuid,
        pipeline: Option<Pipeline>,
        flush: bool,
        reason: StopReason,
    ) -> Result<RecordingSession, SessionError> {
        if flush {
            debug!("Session {} is short, flushing buffered audio", session_id);
            if let Err(e) = self.engine.flush(session_id).await {
                warn!("Flush for session {} failed: {}", session_id, e);
            }
        }

        let summary = self.engine.stop(session_id).await;

        let output = match pipeline {
            Some(pipeline) => {
                pipeline.closing.cancel();
                pipeline.forwarder.await.unwrap_or_else(|e| {
                    error!("Segment forwarder for session {} panicked: {}", session_id, e);
                    PipelineOutput::default()
                })
            }
            None => PipelineOutput::default(),
        };

        let (translation_state, translated) = match output.translation {
            Some(stage) => {
                self.set_translation_state(session_id, TranslationState::Draining)
                    .await;
                let (state, segments) = stage.drain(self.config.drain_timeout()).await;
                (Some(state), Some(segments))
            }
            None => (None, None),
        };

        let markers = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&session_id)
                .map(|e| e.session.markers.clone())
                .unwrap_or_default()
        };
        let archive = write_archive(
            &self.sessions_dir.join(session_id.to_string()),
            &output.transcript,
            translated.as_deref(),
            &markers,
        )
        .await;

        let snapshot = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;

            let mut failure = None;
            match summary {
                Ok(summary) => entry.session.audio_duration_secs = summary.audio_duration_secs,
                Err(e) => failure = Some(e.to_string()),
            }
            match archive {
                Ok(archive) => entry.session.archive = Some(archive),
                Err(e) => {
                    failure.get_or_insert_with(|| format!("Failed to archive session: {e:#}"));
                }
            }
            if translation_state.is_some() {
                entry.session.translation = translation_state;
            }

            entry.pipeline = None;
            entry.confirmation = None;
            entry.session.error = failure;
            entry.session.state = if entry.session.error.is_some() {
                SessionState::Failed
            } else {
                SessionState::Stopped
            };
            self.persist(&entry.session);
            entry.session.clone()
        };

        let title = snapshot
            .title
            .clone()
            .unwrap_or_else(|| "Manual session".to_string());
        match &snapshot.error {
            None => {
                info!(
                    "Session {} stopped ({:?}, {} segment(s), {:.1}s audio)",
                    session_id,
                    reason,
                    output.transcript.len(),
                    snapshot.audio_duration_secs
                );
                self.publish(SessionEvent::Stopped {
                    session_id,
                    event_id: snapshot.event_id.clone(),
                    reason,
                });
                self.notifier.notify(
                    Notification::new(NotificationKind::SessionStopped, "Recording saved", title)
                        .for_event(snapshot.event_id.as_deref())
                        .for_session(session_id),
                );
            }
            Some(error) => {
                error!("Session {} failed while stopping: {}", session_id, error);
                self.publish(SessionEvent::Failed {
                    session_id,
                    event_id: snapshot.event_id.clone(),
                    error: error.clone(),
                });
                self.notifier.notify(
                    Notification::new(NotificationKind::SessionFailed, "Recording failed", error.clone())
                        .for_event(snapshot.event_id.as_deref())
                        .for_session(session_id),
                );
            }
        }
        Ok(snapshot)
    }

    async fn fail(&self, session_id: Uuid, error: String) {
        let event_id = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&session_id) else {
                return;
            };
            entry.session.state = SessionState::Failed;
            entry.session.error = Some(error.clone());
            self.persist(&entry.session);
            entry.session.event_id.clone()
        };

        self.notifier.notify(
            Notification::new(NotificationKind::SessionFailed, "Recording failed", error.clone())
                .for_event(event_id.as_deref())
                .for_session(session_id),
        );
        self.publish(SessionEvent::Failed {
            session_id,
            event_id,
            error,
        });
    }

    async fn set_translation_state(&self, session_id: Uuid, state: TranslationState) {
        if let Some(entry) = self.sessions.lock().await.get_mut(&session_id) {
            entry.session.translation = Some(state);
        }
    }

    fn load(&self, session_id: Uuid) -> Result<RecordingSession, SessionError> {
        let Some(db) = &self.db else {
            return Err(SessionError::NotFound(session_id));
        };
        SessionRepository::get(&*db.conn()?, session_id)?.ok_or(SessionError::NotFound(session_id))
    }

    fn persist(&self, session: &RecordingSession) {
        let Some(db) = &self.db else {
            return;
        };
        let result = db
            .conn()
            .and_then(|conn| SessionRepository::upsert(&conn, session));
        if let Err(e) = result {
            error!("Failed to persist session {}: {:#}", session.id, e);
        }
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Collect one session's segments and feed its translation stage. Returns
/// once the engine closes the stream, or once `closing` fires and the
/// remaining buffered segments are taken.
async fn forward_segments(
    session_id: Uuid,
    mut segments: mpsc::Receiver<TranscriptSegment>,
    translation: Option<TranslationStage>,
    closing: CancellationToken,
) -> PipelineOutput {
    let mut transcript = Vec::new();
    let mut accept = |segment: TranscriptSegment| {
        if let Some(stage) = &translation {
            stage.submit(segment.clone());
        }
        transcript.push(segment);
    };

    loop {
        tokio::select! {
            biased;
            segment = segments.recv() => match segment {
                Some(segment) => accept(segment),
                None => break,
            },
            _ = closing.cancelled() => {
                while let Ok(segment) = segments.try_recv() {
                    accept(segment);
                }
                break;
            }
        }
    }

    debug!(
        "Segment stream for session {} closed after {} segment(s)",
        session_id,
        transcript.len()
    );
    PipelineOutput {
        transcript,
        translation,
    }
}
