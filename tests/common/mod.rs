//! Fakes shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use autoscribe::engine::{CaptureEngine, CaptureHandle, CaptureSummary, Translator};
use autoscribe::error::{SessionError, TaskError};
use autoscribe::notify::{Notification, NotificationKind, Notifier, StopConfirmationRequest, StopDecision};
use autoscribe::queue::{JobContext, JobProcessor};
use autoscribe::session::{SessionOptions, TranscriptSegment};

/// Poll `check` until it holds, failing the test after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// What the processor does on one attempt for a given input.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient,
    Fatal,
    /// Block until cancelled, then return a transcript anyway.
    FinishDespiteCancel,
    /// Block until the gate is opened, then succeed.
    WaitFor(Arc<Notify>),
}

/// Job processor driven by per-input scripts. Inputs without a script (or
/// whose script ran out) succeed after a short pause. `.xyz` inputs fail
/// validation.
#[derive(Default)]
pub struct ScriptedProcessor {
    scripts: Mutex<HashMap<PathBuf, VecDeque<Step>>>,
    in_flight: Mutex<HashSet<Uuid>>,
    overlaps: AtomicUsize,
    attempts: Mutex<Vec<(Uuid, PathBuf)>>,
}

impl ScriptedProcessor {
    pub fn script(&self, input: impl Into<PathBuf>, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(input.into(), steps.into_iter().collect());
    }

    /// Times a job id was seen by two workers at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<(Uuid, PathBuf)> {
        self.attempts.lock().unwrap().clone()
    }

    fn next_step(&self, input: &Path) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(input)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    fn validate(&self, input: &Path) -> Result<(), TaskError> {
        match input.extension().and_then(|e| e.to_str()) {
            Some("xyz") => Err(TaskError::Validation("Unsupported input format: xyz".to_string())),
            _ => Ok(()),
        }
    }

    async fn process(&self, input: &Path, ctx: &JobContext) -> Result<String, TaskError> {
        let job_id = ctx.job_id();
        if !self.in_flight.lock().unwrap().insert(job_id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.attempts
            .lock()
            .unwrap()
            .push((job_id, input.to_path_buf()));

        let result = match self.next_step(input) {
            Step::Succeed => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.report_progress(50).await;
                ctx.checkpoint()
                    .map(|()| format!("transcript of {}", input.display()))
            }
            Step::Transient => Err(TaskError::TransientEngine("engine busy".to_string())),
            Step::Fatal => Err(TaskError::Validation("corrupt audio".to_string())),
            Step::FinishDespiteCancel => {
                ctx.cancelled().await;
                Ok("late transcript".to_string())
            }
            Step::WaitFor(gate) => {
                gate.notified().await;
                Ok(format!("transcript of {}", input.display()))
            }
        };

        self.in_flight.lock().unwrap().remove(&job_id);
        result
    }
}

/// Capture engine whose segments are pushed by the test.
pub struct FakeCapture {
    available: AtomicBool,
    live: Mutex<HashMap<Uuid, mpsc::Sender<TranscriptSegment>>>,
    counters: Mutex<HashMap<Uuid, usize>>,
    flushed: Mutex<Vec<Uuid>>,
    stopped: Mutex<Vec<Uuid>>,
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            live: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            flushed: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        }
    }
}

impl FakeCapture {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Emit one transcript segment for `session_id`.
    pub async fn emit(&self, session_id: Uuid, text: &str) {
        let tx = self.live.lock().unwrap().get(&session_id).cloned();
        let tx = tx.unwrap_or_else(|| panic!("session {session_id} is not capturing"));
        let index = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(session_id).or_insert(0);
            *counter += 1;
            *counter - 1
        };
        tx.send(TranscriptSegment {
            index,
            start_secs: index as f64 * 5.0,
            end_secs: index as f64 * 5.0 + 5.0,
            text: text.to_string(),
        })
        .await
        .unwrap();
    }

    pub fn is_capturing(&self, session_id: Uuid) -> bool {
        self.live.lock().unwrap().contains_key(&session_id)
    }

    pub fn flushed(&self) -> Vec<Uuid> {
        self.flushed.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<Uuid> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureEngine for FakeCapture {
    fn is_source_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start(
        &self,
        session_id: Uuid,
        _options: &SessionOptions,
    ) -> Result<CaptureHandle, SessionError> {
        let (tx, rx) = mpsc::channel(64);
        self.live.lock().unwrap().insert(session_id, tx);
        Ok(CaptureHandle { segments: rx })
    }

    async fn add_marker(&self, session_id: Uuid, _label: &str) -> Result<(), SessionError> {
        if self.is_capturing(session_id) {
            Ok(())
        } else {
            Err(SessionError::Engine(format!("no capture for {session_id}")))
        }
    }

    async fn captured_duration(&self, session_id: Uuid) -> Option<f64> {
        let segments = self.counters.lock().unwrap().get(&session_id).copied();
        Some(segments.unwrap_or(0) as f64 * 5.0)
    }

    async fn flush(&self, session_id: Uuid) -> Result<(), SessionError> {
        self.flushed.lock().unwrap().push(session_id);
        Ok(())
    }

    async fn stop(&self, session_id: Uuid) -> Result<CaptureSummary, SessionError> {
        // Dropping the sender closes the segment stream.
        self.live.lock().unwrap().remove(&session_id);
        self.stopped.lock().unwrap().push(session_id);
        let segments = self
            .counters
            .lock()
            .unwrap()
            .get(&session_id)
            .copied()
            .unwrap_or(0);
        Ok(CaptureSummary {
            audio_duration_secs: segments as f64 * 5.0,
            audio_path: None,
        })
    }
}

/// Prefixes text with the target language.
pub struct TaggingTranslator;

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> anyhow::Result<String> {
        Ok(format!("[{target_language}] {text}"))
    }
}

/// Records notifications and answers stop prompts from a script. Once the
/// script runs out, prompts stay unanswered.
#[derive(Default)]
pub struct ScriptedNotifier {
    notifications: Mutex<Vec<Notification>>,
    decisions: Mutex<VecDeque<StopDecision>>,
    prompts: Mutex<Vec<(StopConfirmationRequest, tokio::time::Instant)>>,
    withdrawn: Mutex<Vec<Uuid>>,
}

impl ScriptedNotifier {
    pub fn answer_with(&self, decisions: impl IntoIterator<Item = StopDecision>) {
        self.decisions.lock().unwrap().extend(decisions);
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    pub fn prompts(&self) -> Vec<(StopConfirmationRequest, tokio::time::Instant)> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn withdrawn(&self) -> Vec<Uuid> {
        self.withdrawn.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }

    async fn request_stop_confirmation(&self, request: StopConfirmationRequest) -> StopDecision {
        self.prompts
            .lock()
            .unwrap()
            .push((request, tokio::time::Instant::now()));
        let decision = self.decisions.lock().unwrap().pop_front();
        match decision {
            Some(decision) => decision,
            None => std::future::pending().await,
        }
    }

    fn withdraw_stop_confirmation(&self, session_id: Uuid) {
        self.withdrawn.lock().unwrap().push(session_id);
    }
}
