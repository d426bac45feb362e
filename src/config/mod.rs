use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Lower bound for the auto-start compensation window.
pub const MIN_COMPENSATION_SECONDS: u64 = 60;
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub realtime: RealtimeConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

/// What to do with a job found `processing` when the service starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanedJobPolicy {
    Fail,
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub worker_concurrency: usize,
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts, in seconds.
    pub retry_backoff_base_secs: f64,
    /// Terminal jobs older than this are reaped.
    pub retention_hours: u64,
    pub orphaned_jobs: OrphanedJobPolicy,
    /// Defaults to `<data_dir>/transcripts` when unset.
    pub output_dir: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            max_retries: 3,
            retry_backoff_base_secs: 2.0,
            retention_hours: 24 * 7,
            orphaned_jobs: OrphanedJobPolicy::Fail,
            output_dir: None,
        }
    }
}

impl QueueConfig {
    /// Delay before retry attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.retry_backoff_base_secs.max(0.0) * 2f64.powi(exponent);
        Duration::from_secs_f64(secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn output_dir(&self) -> Result<PathBuf> {
        match &self.output_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => global::transcripts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    pub reminder_minutes: i64,
    pub auto_start_compensation_seconds: u64,
    pub auto_stop_grace_minutes: i64,
    /// Defaults to `<config_dir>/calendar.json` when unset.
    pub calendar_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60,
            reminder_minutes: 5,
            auto_start_compensation_seconds: 120,
            auto_stop_grace_minutes: 5,
            calendar_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reminder_minutes.max(0))
    }

    pub fn compensation(&self) -> chrono::Duration {
        let secs = self
            .auto_start_compensation_seconds
            .max(MIN_COMPENSATION_SECONDS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn stop_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.auto_stop_grace_minutes.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stop_confirmation_delay_minutes: u64,
    /// Force the stop after this many deferred prompts. Unset means the
    /// prompt repeats until the user confirms.
    pub max_stop_deferrals: Option<u32>,
    /// Manual stops with less captured audio than this flush buffered audio
    /// first. Engines that do not count audio are measured by wall-clock time.
    pub min_flush_duration_secs: u64,
    pub translation_drain_timeout_secs: u64,
    /// Shell command that records audio to `$AUTOSCRIBE_OUTPUT` until killed.
    pub capture_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_confirmation_delay_minutes: 5,
            max_stop_deferrals: None,
            min_flush_duration_secs: 10,
            translation_drain_timeout_secs: 30,
            capture_command:
                "pw-record --rate 16000 --channels 1 --format s16 \"$AUTOSCRIBE_OUTPUT\""
                    .to_string(),
        }
    }
}

impl SessionConfig {
    pub fn stop_delay(&self) -> Duration {
        Duration::from_secs(self.stop_confirmation_delay_minutes * 60)
    }

    pub fn min_flush_duration(&self) -> Duration {
        Duration::from_secs(self.min_flush_duration_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.translation_drain_timeout_secs)
    }
}

/// Global defaults for live sessions. Event auto-task config overrides
/// individual keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enable_transcription: bool,
    pub enable_recording: bool,
    pub enable_translation: bool,
    pub target_language: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enable_transcription: true,
            enable_recording: true,
            enable_translation: false,
            target_language: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_endpoint: String,
    pub language: Option<String>,
    pub poll_interval_secs: u64,
    /// Reads text on stdin, writes the translation to stdout.
    /// `$AUTOSCRIBE_TARGET_LANGUAGE` is set for each call.
    pub translate_command: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "http://127.0.0.1:3141/api/v1/jobs".to_string(),
            language: Some("en".to_string()),
            poll_interval_secs: 2,
            translate_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3737,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config = Self::parse(&content)?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.normalize();
        Ok(config)
    }

    /// Pull out-of-range values back into their supported range.
    pub fn normalize(&mut self) {
        let workers = self.queue.worker_concurrency;
        let clamped = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        if clamped != workers {
            warn!(
                "worker_concurrency {} out of range, using {}",
                workers, clamped
            );
            self.queue.worker_concurrency = clamped;
        }

        let compensation = self.scheduler.auto_start_compensation_seconds;
        if compensation < MIN_COMPENSATION_SECONDS {
            warn!(
                "auto_start_compensation_seconds {} below the {}s floor, raising it",
                compensation, MIN_COMPENSATION_SECONDS
            );
            self.scheduler.auto_start_compensation_seconds = MIN_COMPENSATION_SECONDS;
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
