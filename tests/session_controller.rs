mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autoscribe::config::SessionConfig;
use autoscribe::db::Database;
use autoscribe::engine::Translator;
use autoscribe::error::SessionError;
use autoscribe::notify::{NotificationKind, StopDecision};
use autoscribe::session::{
    SessionController, SessionEvent, SessionOptions, SessionState, StartRequest, StopReason,
    TranslationState,
};
use common::{eventually, FakeCapture, ScriptedNotifier, TaggingTranslator};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    sessions: SessionController,
    capture: Arc<FakeCapture>,
    notifier: Arc<ScriptedNotifier>,
}

fn harness(dir: &Path, config: SessionConfig, db: Option<Database>) -> Harness {
    let capture = Arc::new(FakeCapture::default());
    let notifier = Arc::new(ScriptedNotifier::default());
    let translator: Arc<dyn Translator> = Arc::new(TaggingTranslator);
    let sessions = SessionController::new(
        config,
        dir.join("sessions"),
        capture.clone(),
        Some(translator),
        notifier.clone(),
        db,
    )
    .unwrap();
    Harness {
        sessions,
        capture,
        notifier,
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        enable_transcription: true,
        enable_recording: true,
        enable_translation: false,
        target_language: None,
    }
}

fn for_event(event_id: &str) -> StartRequest {
    StartRequest {
        event_id: Some(event_id.to_string()),
        title: Some(format!("Meeting {event_id}")),
        scheduled_end: Some(chrono::Utc::now()),
        options: options(),
    }
}

async fn wait_for_state(sessions: &SessionController, id: Uuid, state: SessionState) {
    eventually(WAIT, || async { sessions.get(id).await.unwrap().state == state }).await;
}

async fn next_stopped(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> StopReason {
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::Stopped { reason, .. } => return reason,
            SessionEvent::Failed { error, .. } => panic!("session failed: {error}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_manual_session_writes_archive() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h.sessions.start(StartRequest::manual(options())).await.unwrap();
    assert_eq!(session.state, SessionState::Recording);
    assert!(session.started_at.is_some());

    h.capture.emit(session.id, "first point").await;
    h.capture.emit(session.id, "second point").await;
    let marker = h.sessions.add_marker(session.id, "decision").await.unwrap();
    assert_eq!(marker.label, "decision");

    let stopped = h.sessions.stop(session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(stopped.audio_duration_secs, 10.0);
    assert!(stopped.translation.is_none());

    let archive = stopped.archive.unwrap();
    let transcript = std::fs::read_to_string(&archive.transcript_path).unwrap();
    assert_eq!(transcript, "[00:00:00] first point\n[00:00:05] second point\n");
    assert!(archive.translation_path.is_none());
    let markers = std::fs::read_to_string(&archive.markers_path).unwrap();
    assert!(markers.contains("decision"));

    assert_eq!(h.notifier.count(NotificationKind::SessionStarted), 1);
    assert_eq!(h.notifier.count(NotificationKind::SessionStopped), 1);
}

#[tokio::test]
async fn test_flush_threshold_counts_captured_audio() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let short = h.sessions.start(StartRequest::manual(options())).await.unwrap();
    h.capture.emit(short.id, "quick note").await;
    h.sessions.stop(short.id).await.unwrap();
    assert_eq!(h.capture.flushed(), vec![short.id]);

    // Stopped right away, but 15 seconds of audio is past the threshold.
    let long = h.sessions.start(StartRequest::manual(options())).await.unwrap();
    for text in ["one", "two", "three"] {
        h.capture.emit(long.id, text).await;
    }
    let stopped = h.sessions.stop(long.id).await.unwrap();
    assert_eq!(stopped.audio_duration_secs, 15.0);
    assert_eq!(h.capture.flushed(), vec![short.id]);
}

#[tokio::test]
async fn test_stop_is_idempotent_once_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h.sessions.start(StartRequest::manual(options())).await.unwrap();
    h.sessions.stop(session.id).await.unwrap();
    let again = h.sessions.stop(session.id).await.unwrap();

    assert_eq!(again.state, SessionState::Stopped);
    assert_eq!(h.capture.stopped(), vec![session.id]);

    let err = h.sessions.add_marker(session.id, "late").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));
}

#[tokio::test]
async fn test_stop_while_starting_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let id = h
        .sessions
        .start_detached(StartRequest::manual(options()))
        .await
        .unwrap();
    let err = h.sessions.stop(id).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidState {
            state: SessionState::Starting,
            ..
        }
    ));

    wait_for_state(&h.sessions, id, SessionState::Recording).await;
}

#[tokio::test]
async fn test_duplicate_start_for_event_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let first = h.sessions.start(for_event("evt-1")).await.unwrap();
    let err = h.sessions.start(for_event("evt-1")).await.unwrap_err();
    match err {
        SessionError::AlreadyActive { session_id, .. } => assert_eq!(session_id, first.id),
        other => panic!("unexpected error: {other}"),
    }

    // A stopped session no longer blocks a new one.
    h.sessions.stop(first.id).await.unwrap();
    h.sessions.start(for_event("evt-1")).await.unwrap();
}

#[tokio::test]
async fn test_unavailable_capture_source() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);
    h.capture.set_available(false);

    let err = h.sessions.start(StartRequest::manual(options())).await.unwrap_err();
    assert!(matches!(err, SessionError::CaptureUnavailable));
    assert!(h.sessions.list().await.is_empty());
}

#[tokio::test]
async fn test_translation_is_drained_into_archive() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h
        .sessions
        .start(StartRequest::manual(SessionOptions {
            enable_translation: true,
            target_language: Some("de".to_string()),
            ..options()
        }))
        .await
        .unwrap();
    assert_eq!(session.translation, Some(TranslationState::Active));

    h.capture.emit(session.id, "hello").await;
    h.capture.emit(session.id, "goodbye").await;

    let stopped = h.sessions.stop(session.id).await.unwrap();
    assert_eq!(stopped.translation, Some(TranslationState::Complete));
    let archive = stopped.archive.unwrap();
    let translation = std::fs::read_to_string(archive.translation_path.unwrap()).unwrap();
    assert_eq!(translation, "[00:00:00] [de] hello\n[00:00:05] [de] goodbye\n");
}

#[tokio::test]
async fn test_overlapping_sessions_keep_their_own_transcripts() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let a = h.sessions.start(for_event("a")).await.unwrap();
    let b = h.sessions.start(for_event("b")).await.unwrap();
    assert_eq!(h.sessions.active_sessions().await.len(), 2);

    h.capture.emit(a.id, "alpha one").await;
    h.capture.emit(b.id, "beta one").await;
    h.capture.emit(a.id, "alpha two").await;
    h.sessions.add_marker(b.id, "beta marker").await.unwrap();

    let a = h.sessions.stop(a.id).await.unwrap();
    h.capture.emit(b.id, "beta two").await;
    let b = h.sessions.stop(b.id).await.unwrap();

    let a_text = std::fs::read_to_string(a.archive.unwrap().transcript_path).unwrap();
    let b_text = std::fs::read_to_string(b.archive.unwrap().transcript_path).unwrap();
    assert_eq!(a_text, "[00:00:00] alpha one\n[00:00:05] alpha two\n");
    assert_eq!(b_text, "[00:00:00] beta one\n[00:00:05] beta two\n");
    assert!(a.markers.is_empty());
    assert_eq!(b.markers.len(), 1);
}

#[tokio::test]
async fn test_confirmed_scheduled_stop() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);
    let mut events = h.sessions.subscribe();

    let session = h.sessions.start(for_event("evt-1")).await.unwrap();
    h.notifier.answer_with([StopDecision::StopNow]);
    assert!(h.sessions.request_stop(session.id).await.unwrap());

    assert_eq!(next_stopped(&mut events).await, StopReason::Scheduled);
    let stopped = h.sessions.get(session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert!(stopped.archive.is_some());
    assert!(h.capture.flushed().is_empty());

    let (prompt, _) = &h.notifier.prompts()[0];
    assert_eq!(prompt.event_id.as_deref(), Some("evt-1"));
    assert_eq!(prompt.deferrals, 0);
}

#[tokio::test]
async fn test_second_stop_request_while_prompt_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h.sessions.start(for_event("evt-1")).await.unwrap();
    assert!(h.sessions.request_stop(session.id).await.unwrap());
    assert!(!h.sessions.request_stop(session.id).await.unwrap());
    assert_eq!(
        h.sessions.get(session.id).await.unwrap().state,
        SessionState::StopPendingConfirmation
    );

    eventually(WAIT, || async { h.notifier.prompts().len() == 1 }).await;

    // A manual stop overrides the open prompt.
    let stopped = h.sessions.stop(session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(h.notifier.withdrawn(), vec![session.id]);
    assert_eq!(h.notifier.prompts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delay_reprompts_only_after_the_delay() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h.sessions.start(for_event("evt-1")).await.unwrap();
    h.notifier.answer_with([StopDecision::Delay { minutes: 10 }]);
    assert!(h.sessions.request_stop(session.id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let current = h.sessions.get(session.id).await.unwrap();
    assert_eq!(current.state, SessionState::Recording);
    assert_eq!(current.stop_deferrals, 1);
    assert_eq!(h.notifier.prompts().len(), 1);

    // A scheduler tick during the delay must not prompt again.
    assert!(!h.sessions.request_stop(session.id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(9 * 60 + 57)).await;
    assert_eq!(h.notifier.prompts().len(), 1);
    assert_eq!(
        h.sessions.get(session.id).await.unwrap().state,
        SessionState::Recording
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    let prompts = h.notifier.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].1 - prompts[0].1 >= Duration::from_secs(600));
    assert_eq!(prompts[1].0.deferrals, 1);
    assert_eq!(
        h.sessions.get(session.id).await.unwrap().state,
        SessionState::StopPendingConfirmation
    );
}

#[tokio::test(start_paused = true)]
async fn test_deferral_cap_forces_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        max_stop_deferrals: Some(2),
        ..Default::default()
    };
    let h = harness(dir.path(), config, None);
    let mut events = h.sessions.subscribe();

    let session = h.sessions.start(for_event("evt-1")).await.unwrap();
    h.notifier.answer_with([
        StopDecision::Delay { minutes: 1 },
        StopDecision::Delay { minutes: 0 },
    ]);
    assert!(h.sessions.request_stop(session.id).await.unwrap());

    assert_eq!(next_stopped(&mut events).await, StopReason::Scheduled);
    let stopped = h.sessions.get(session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(stopped.stop_deferrals, 2);
    assert_eq!(h.notifier.prompts().len(), 2);
}

#[tokio::test]
async fn test_scheduled_end_updates() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), SessionConfig::default(), None);

    let session = h.sessions.start(for_event("evt-1")).await.unwrap();
    let later = session.scheduled_end.unwrap() + chrono::Duration::minutes(30);

    assert!(h.sessions.update_scheduled_end(session.id, later).await);
    assert!(!h.sessions.update_scheduled_end(session.id, later).await);
    assert!(!h.sessions.update_scheduled_end(Uuid::new_v4(), later).await);

    let found = h.sessions.active_for_event("evt-1").await.unwrap();
    assert_eq!(found.scheduled_end, Some(later));
}

#[tokio::test]
async fn test_sessions_persist_and_reconcile_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();

    let h = harness(dir.path(), SessionConfig::default(), Some(db.clone()));
    let done = h.sessions.start(for_event("done")).await.unwrap();
    h.sessions.stop(done.id).await.unwrap();
    let live = h.sessions.start(for_event("live")).await.unwrap();

    let restarted = harness(dir.path(), SessionConfig::default(), Some(db));
    let live = restarted.sessions.get(live.id).await.unwrap();
    assert_eq!(live.state, SessionState::Failed);
    assert!(live.error.is_some());

    let done = restarted.sessions.get(done.id).await.unwrap();
    assert_eq!(done.state, SessionState::Stopped);
    assert!(done.archive.is_some());

    // Stopping a stored, finished session just returns it.
    let again = restarted.sessions.stop(done.id).await.unwrap();
    assert_eq!(again.state, SessionState::Stopped);
}
