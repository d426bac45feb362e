//! Fixed-size worker pool over a FIFO of batch transcription jobs.
//!
//! All job state lives behind one async mutex. Dispatch, cancellation and
//! finalization each take that lock, which is what guarantees a job is never
//! handed to two workers and that a cancelled job never gets its output
//! renamed into place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::{JobContext, JobProcessor, ProgressSink};
use super::job::{Job, JobEvent, JobStatus};
use crate::config::{QueueConfig, MAX_WORKERS, MIN_WORKERS};
use crate::db::{Database, JobRepository};
use crate::error::{QueueError, TaskError};

const EVENT_CAPACITY: usize = 256;
const REAP_INTERVAL: Duration = Duration::from_secs(3600);

/// What [`TaskQueue::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still pending and has been dropped before dispatch.
    Removed,
    /// The job is running; it ends Cancelled at its next checkpoint.
    Signalled,
    AlreadyCancelled,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
    tokens: HashMap<Uuid, CancellationToken>,
    /// Only read and written under the state lock so dispatch sees it.
    paused: bool,
}

struct Dispatch {
    job_id: Uuid,
    input: PathBuf,
    token: CancellationToken,
}

struct Shared {
    config: QueueConfig,
    output_dir: PathBuf,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<JobEvent>,
    processor: Arc<dyn JobProcessor>,
    db: Option<Database>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Build the queue, reconciling and restoring persisted jobs when a
    /// database is given. Workers do not run until [`TaskQueue::start`].
    pub fn new(
        config: QueueConfig,
        output_dir: PathBuf,
        processor: Arc<dyn JobProcessor>,
        db: Option<Database>,
    ) -> Result<Self, QueueError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut state = QueueState::default();

        if let Some(db) = &db {
            let conn = db.conn()?;
            let reconciled = JobRepository::reconcile_orphaned(&conn, config.orphaned_jobs)?;
            if reconciled > 0 {
                warn!(
                    "Reconciled {} job(s) left processing by a previous run (policy: {:?})",
                    reconciled, config.orphaned_jobs
                );
            }

            for job in JobRepository::list_pending(&conn)? {
                state.pending.push_back(job.id);
                state.jobs.insert(job.id, job);
            }
            if !state.pending.is_empty() {
                info!("Restored {} pending job(s)", state.pending.len());
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                output_dir,
                state: Mutex::new(state),
                wake: Notify::new(),
                events,
                processor,
                db,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Spawn the worker pool and the retention reaper.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let workers = self
            .shared
            .config
            .worker_concurrency
            .clamp(MIN_WORKERS, MAX_WORKERS);
        info!("Starting task queue with {} worker(s)", workers);

        let mut handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&self.shared), worker)))
            .collect();

        let queue = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        queue.reap(Utc::now()).await;
                    }
                    _ = queue.shared.shutdown.cancelled() => break,
                }
            }
        }));

        handles
    }

    /// Stop dispatching; running jobs finish their current attempt.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub async fn enqueue(&self, input: impl Into<PathBuf>) -> Result<Uuid, QueueError> {
        let mut job = Job::new(input);
        let validation = self.shared.processor.validate(&job.input);

        let job_id = job.id;
        let mut state = self.shared.state.lock().await;

        self.shared.try_persist(&job)?;
        self.shared.publish(&job);

        let dispatchable = match validation {
            Ok(()) => {
                state.pending.push_back(job_id);
                info!("Enqueued job {} ({:?})", job_id, job.input);
                true
            }
            Err(e) => {
                warn!("Job {} rejected: {}", job_id, e);
                job.mark_failed(e.to_string());
                self.shared.persist(&job);
                self.shared.publish(&job);
                false
            }
        };

        state.jobs.insert(job_id, job);
        drop(state);

        if dispatchable {
            self.shared.wake.notify_one();
        }
        Ok(job_id)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, QueueError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Err(self.shared.missing_job_error(job_id, "cancel"));
        };

        let outcome = match job.status {
            JobStatus::Pending => {
                state.pending.retain(|id| *id != job_id);
                job.mark_cancelled();
                info!("Job {} cancelled before dispatch", job_id);
                CancelOutcome::Removed
            }
            JobStatus::Processing => {
                if job.cancel_requested {
                    return Ok(CancelOutcome::Signalled);
                }
                job.cancel_requested = true;
                if let Some(token) = state.tokens.get(&job_id) {
                    token.cancel();
                }
                info!("Cancellation requested for running job {}", job_id);
                CancelOutcome::Signalled
            }
            JobStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
            status => {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    status,
                    action: "cancel",
                })
            }
        };

        let snapshot = job.clone();
        self.shared.persist(&snapshot);
        self.shared.publish(&snapshot);
        Ok(outcome)
    }

    /// Stop handing out new jobs. A job already processing keeps running.
    /// Once this returns no worker dispatches another job until `resume`.
    pub async fn pause(&self) {
        let mut state = self.shared.state.lock().await;
        if !state.paused {
            state.paused = true;
            info!("Task queue paused");
        }
    }

    pub async fn resume(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.paused {
                state.paused = false;
                info!("Task queue resumed");
            }
        }
        self.shared.wake.notify_waiters();
    }

    pub async fn is_paused(&self) -> bool {
        self.shared.state.lock().await.paused
    }

    /// Re-enqueue a failed job after the backoff for its next attempt.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), QueueError> {
        let max_retries = self.shared.config.max_retries;
        let delay = {
            let mut state = self.shared.state.lock().await;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Err(self.shared.missing_job_error(job_id, "retry"));
            };

            if job.status != JobStatus::Failed {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    status: job.status,
                    action: "retry",
                });
            }
            if job.retry_count >= max_retries {
                return Err(QueueError::RetryLimitReached {
                    job_id,
                    retry_count: job.retry_count,
                    max_retries,
                });
            }

            job.reset_for_retry();
            let snapshot = job.clone();
            self.shared.persist(&snapshot);
            self.shared.publish(&snapshot);
            self.shared.config.backoff_for(snapshot.retry_count)
        };

        info!("Job {} scheduled for retry in {:?}", job_id, delay);
        self.shared.schedule_requeue(job_id, delay);
        Ok(())
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<Job, QueueError> {
        if let Some(job) = self.shared.state.lock().await.jobs.get(&job_id) {
            return Ok(job.clone());
        }

        if let Some(db) = &self.shared.db {
            let conn = db.conn()?;
            if let Some(job) = JobRepository::get(&conn, job_id)? {
                return Ok(job);
            }
        }

        Err(QueueError::NotFound(job_id))
    }

    /// Jobs held in memory, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let state = self.shared.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Wait until the job reaches Completed, Failed or Cancelled.
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let mut events = self.subscribe();
        loop {
            let job = self.get_status(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.get_status(job_id).await,
            }
        }
    }

    /// Drop terminal jobs that finished before the retention window.
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::hours(self.shared.config.retention_hours as i64);

        let removed = {
            let mut state = self.shared.state.lock().await;
            let before = state.jobs.len();
            state.jobs.retain(|_, job| {
                !(job.status.is_terminal() && job.completed_at.map_or(false, |t| t < cutoff))
            });
            before - state.jobs.len()
        };

        if let Some(db) = &self.shared.db {
            let pruned = db
                .conn()
                .and_then(|conn| JobRepository::prune_terminal(&conn, cutoff));
            match pruned {
                Ok(count) if count > 0 => info!("Pruned {} expired job record(s)", count),
                Ok(_) => {}
                Err(e) => error!("Failed to prune expired jobs: {:#}", e),
            }
        }

        if removed > 0 {
            debug!("Reaped {} terminal job(s) from memory", removed);
        }
        removed
    }

    /// Final location of a completed job's transcript.
    pub fn output_path(&self, job_id: Uuid) -> PathBuf {
        self.shared.final_path(job_id)
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!("Worker {} started", worker);
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        // Register interest before checking, so a wake between the check
        // and the wait is not lost.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(dispatch) = shared.next_job().await {
            Arc::clone(&shared).run(worker, dispatch).await;
            continue;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = shared.shutdown.cancelled() => break,
        }
    }
    debug!("Worker {} stopped", worker);
}

impl Shared {
    async fn next_job(&self) -> Option<Dispatch> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.paused {
            return None;
        }
        while let Some(job_id) = state.pending.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }

            job.mark_processing();
            let token = CancellationToken::new();
            state.tokens.insert(job_id, token.clone());

            self.persist(job);
            self.publish(job);
            return Some(Dispatch {
                job_id,
                input: job.input.clone(),
                token,
            });
        }
        None
    }

    async fn run(self: Arc<Self>, worker: usize, dispatch: Dispatch) {
        let Dispatch {
            job_id,
            input,
            token,
        } = dispatch;
        info!("Worker {} processing job {} ({:?})", worker, job_id, input);

        let sink: Arc<dyn ProgressSink> = self.clone();
        let ctx = JobContext::new(job_id, token.clone(), sink);

        let outcome = match self.processor.process(&input, &ctx).await {
            Ok(text) => self.stage_output(job_id, &token, &text).await,
            Err(e) => Err(e),
        };

        self.finish(job_id, outcome).await;
    }

    /// Write the transcript under a temporary name. Only `finish` may move it
    /// to its final name.
    async fn stage_output(
        &self,
        job_id: Uuid,
        token: &CancellationToken,
        text: &str,
    ) -> Result<PathBuf, TaskError> {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| TaskError::TransientEngine(format!("Failed to create output dir: {e}")))?;

        let staged = self.staging_path(job_id);
        tokio::fs::write(&staged, text)
            .await
            .map_err(|e| TaskError::TransientEngine(format!("Failed to write transcript: {e}")))?;
        Ok(staged)
    }

    async fn finish(self: &Arc<Self>, job_id: Uuid, outcome: Result<PathBuf, TaskError>) {
        let mut requeue_after = None;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.tokens.remove(&job_id);

            let Some(job) = state.jobs.get_mut(&job_id) else {
                warn!("Job {} vanished while processing", job_id);
                if let Ok(staged) = &outcome {
                    discard_staged(staged);
                }
                return;
            };

            if job.cancel_requested || matches!(outcome, Err(TaskError::Cancelled)) {
                if let Ok(staged) = &outcome {
                    discard_staged(staged);
                }
                job.mark_cancelled();
                info!("Job {} cancelled", job_id);
            } else {
                match outcome {
                    Ok(staged) => {
                        let final_path = self.final_path(job_id);
                        match std::fs::rename(&staged, &final_path) {
                            Ok(()) => {
                                info!("Job {} completed: {:?}", job_id, final_path);
                                job.mark_completed(final_path);
                            }
                            Err(e) => {
                                discard_staged(&staged);
                                error!("Job {} could not finalize output: {}", job_id, e);
                                job.mark_failed(format!("Failed to finalize output: {e}"));
                            }
                        }
                    }
                    Err(e) if e.is_retryable() && job.retry_count < self.config.max_retries => {
                        job.reset_for_retry();
                        job.error = Some(e.to_string());
                        let delay = self.config.backoff_for(job.retry_count);
                        warn!(
                            "Job {} failed transiently, retry {}/{} in {:?}: {}",
                            job_id, job.retry_count, self.config.max_retries, delay, e
                        );
                        requeue_after = Some(delay);
                    }
                    Err(e) => {
                        warn!("Job {} failed: {}", job_id, e);
                        job.mark_failed(e.to_string());
                    }
                }
            }

            self.persist(job);
            self.publish(job);
        }

        if let Some(delay) = requeue_after {
            self.schedule_requeue(job_id, delay);
        }
    }

    fn schedule_requeue(self: &Arc<Self>, job_id: Uuid, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.shutdown.cancelled() => return,
            }

            let mut state = shared.state.lock().await;
            let eligible = state
                .jobs
                .get(&job_id)
                .map_or(false, |job| job.status == JobStatus::Pending);
            if eligible && !state.pending.contains(&job_id) {
                state.pending.push_back(job_id);
                drop(state);
                debug!("Job {} back in the queue", job_id);
                shared.wake.notify_one();
            }
        });
    }

    fn final_path(&self, job_id: Uuid) -> PathBuf {
        self.output_dir.join(format!("{job_id}.txt"))
    }

    fn staging_path(&self, job_id: Uuid) -> PathBuf {
        self.output_dir.join(format!("{job_id}.txt.partial"))
    }

    fn missing_job_error(&self, job_id: Uuid, action: &'static str) -> QueueError {
        // Jobs evicted from memory are terminal; report them as such.
        let stored = self.db.as_ref().and_then(|db| {
            db.conn()
                .and_then(|conn| JobRepository::get(&conn, job_id))
                .ok()
                .flatten()
        });
        match stored {
            Some(job) => QueueError::InvalidTransition {
                job_id,
                status: job.status,
                action,
            },
            None => QueueError::NotFound(job_id),
        }
    }

    fn try_persist(&self, job: &Job) -> anyhow::Result<()> {
        match &self.db {
            Some(db) => JobRepository::upsert(&*db.conn()?, job),
            None => Ok(()),
        }
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = self.try_persist(job) {
            error!("Failed to persist job {}: {:#}", job.id, e);
        }
    }

    fn publish(&self, job: &Job) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::from(job));
    }
}

#[async_trait]
impl ProgressSink for Shared {
    async fn report(&self, job_id: Uuid, progress: u8) {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };

        // 100 is reserved for a finalized output.
        let progress = progress.min(99);
        if job.status != JobStatus::Processing || job.cancel_requested || progress <= job.progress {
            return;
        }

        job.progress = progress;
        self.persist(job);
        self.publish(job);
    }
}

fn discard_staged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staged output {:?}: {}", path, e);
        }
    }
}
