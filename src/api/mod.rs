//! REST API server for autoscribe.
//!
//! Provides HTTP endpoints for:
//! - Batch job queue control (enqueue, cancel, retry, pause/resume)
//! - Recording sessions (start, stop, markers)
//! - Answering scheduled stop prompts

pub mod error;
pub mod routes;

use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

use crate::config::RealtimeConfig;
use crate::notify::ChannelNotifier;
use crate::queue::TaskQueue;
use crate::session::SessionController;

/// Handles shared by every route.
#[derive(Clone)]
pub struct ApiState {
    pub queue: TaskQueue,
    pub sessions: SessionController,
    pub notifier: Arc<ChannelNotifier>,
    pub defaults: RealtimeConfig,
}

pub struct ApiServer {
    port: u16,
    state: ApiState,
}

impl ApiServer {
    pub fn new(port: u16, state: ApiState) -> Self {
        Self { port, state }
    }

    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/", get(status))
            .merge(routes::jobs::router(state.clone()))
            .merge(routes::sessions::router(state))
            .layer(ServiceBuilder::new())
    }

    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let app = Self::router(self.state);
        let listener = tokio::net::TcpListener::bind(&format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET  /                        - Service info");
        info!("  GET  /jobs                    - List jobs");
        info!("  POST /jobs                    - Enqueue a file");
        info!("  GET  /jobs/:id                - Job status");
        info!("  POST /jobs/:id/cancel         - Cancel a job");
        info!("  POST /jobs/:id/retry          - Retry a failed job");
        info!("  POST /queue/pause             - Pause dispatch");
        info!("  POST /queue/resume            - Resume dispatch");
        info!("  GET  /sessions                - List sessions");
        info!("  POST /sessions/start          - Start recording");
        info!("  GET  /sessions/:id            - Session status");
        info!("  POST /sessions/:id/stop       - Stop recording");
        info!("  POST /sessions/:id/markers    - Add a marker");
        info!("  GET  /confirmations           - Pending stop prompts");
        info!("  POST /confirmations/:id       - Answer a stop prompt");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "autoscribe",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}
