use crate::api::{ApiServer, ApiState};
use crate::calendar::JsonFileCalendar;
use crate::config::Config;
use crate::db::Database;
use crate::engine::{
    CommandCaptureEngine, CommandTranslator, RemoteTranscriber, TranscriptionJobProcessor,
    Translator,
};
use crate::global;
use crate::notify::ChannelNotifier;
use crate::queue::TaskQueue;
use crate::scheduler::{AutoTaskScheduler, SystemClock};
use crate::session::SessionController;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run_service() -> Result<()> {
    info!("Starting autoscribe service");

    let config = Config::load()?;
    let db = Database::open_default()?;
    let shutdown = CancellationToken::new();

    let transcriber = Arc::new(RemoteTranscriber::new(&config.engine));
    let processor = Arc::new(TranscriptionJobProcessor::new(transcriber.clone()));
    let queue = TaskQueue::new(
        config.queue.clone(),
        config.queue.output_dir()?,
        processor,
        Some(db.clone()),
    )?;
    let workers = queue.start();

    let sessions_dir = global::sessions_dir()?;
    let capture = Arc::new(CommandCaptureEngine::new(
        config.session.capture_command.clone(),
        sessions_dir.clone(),
        transcriber,
    ));
    let translator = config.engine.translate_command.clone().map(|command| {
        Arc::new(CommandTranslator::new(command, TRANSLATE_TIMEOUT)) as Arc<dyn Translator>
    });
    let notifier = Arc::new(ChannelNotifier::new());
    let sessions = SessionController::new(
        config.session.clone(),
        sessions_dir,
        capture,
        translator,
        notifier.clone(),
        Some(db),
    )?;

    if config.scheduler.enabled {
        let calendar_path = match &config.scheduler.calendar_path {
            Some(path) => PathBuf::from(path),
            None => global::calendar_file()?,
        };
        info!("Reading calendar events from {:?}", calendar_path);

        let scheduler = AutoTaskScheduler::new(
            config.scheduler.clone(),
            config.realtime.clone(),
            Arc::new(JsonFileCalendar::new(calendar_path)),
            sessions.clone(),
            notifier.clone(),
            Arc::new(SystemClock),
        );
        tokio::spawn(scheduler.run(shutdown.clone()));
    } else {
        info!("Auto task scheduler disabled");
    }

    let api = if config.api.enabled {
        let api_server = ApiServer::new(
            config.api.port,
            ApiState {
                queue: queue.clone(),
                sessions: sessions.clone(),
                notifier,
                defaults: config.realtime.clone(),
            },
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api_server.start(token).await {
                error!("API server failed: {}", e);
            }
        }))
    } else {
        None
    };

    info!("autoscribe is ready!");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    sessions.stop_all().await;
    shutdown.cancel();
    queue.shutdown();

    for handle in workers {
        let _ = handle.await;
    }
    if let Some(api) = api {
        let _ = api.await;
    }

    info!("autoscribe stopped");
    Ok(())
}
