//! Batch job API endpoints.
//!
//! Provides HTTP endpoints for:
//! - Listing and inspecting jobs (GET /jobs, GET /jobs/:id)
//! - Enqueueing a file (POST /jobs)
//! - Cancelling and retrying (POST /jobs/:id/cancel, POST /jobs/:id/retry)
//! - Pausing and resuming dispatch (POST /queue/pause, POST /queue/resume)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::queue::{CancelOutcome, Job};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub input: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/queue/pause", post(pause_queue))
        .route("/queue/resume", post(resume_queue))
        .with_state(state)
}

fn job_json(job: &Job) -> Value {
    json!({
        "id": job.id,
        "input": job.input,
        "status": job.status,
        "progress": job.progress,
        "retry_count": job.retry_count,
        "cancel_requested": job.cancel_requested,
        "output": job.output,
        "error": job.error,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
    })
}

async fn list_jobs(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ApiState>,
) -> Json<Value> {
    let limit: usize = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);

    let jobs: Vec<Value> = state
        .queue
        .list()
        .await
        .iter()
        .rev()
        .take(limit)
        .map(job_json)
        .collect();

    Json(json!({ "paused": state.queue.is_paused().await, "jobs": jobs }))
}

async fn enqueue_job(
    State(state): State<ApiState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.input.as_os_str().is_empty() {
        return Err(ApiError::bad_request("input must not be empty"));
    }

    info!("Enqueue request received via API: {:?}", request.input);
    let job_id = state.queue.enqueue(request.input).await?;
    let job = state.queue.get_status(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job_json(&job))))
}

async fn get_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let job = state.queue.get_status(id).await?;
    Ok(Json(job_json(&job)))
}

async fn cancel_job(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> ApiResult<Json<Value>> {
    let outcome = state.queue.cancel(id).await?;
    let message = match outcome {
        CancelOutcome::Removed => "Job removed from the queue",
        CancelOutcome::Signalled => "Cancellation requested",
        CancelOutcome::AlreadyCancelled => "Job was already cancelled",
    };
    Ok(Json(json!({ "success": true, "job_id": id, "message": message })))
}

async fn retry_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    state.queue.retry(id).await?;
    let job = state.queue.get_status(id).await?;
    Ok(Json(job_json(&job)))
}

async fn pause_queue(State(state): State<ApiState>) -> Json<Value> {
    state.queue.pause().await;
    Json(json!({ "paused": true }))
}

async fn resume_queue(State(state): State<ApiState>) -> Json<Value> {
    state.queue.resume().await;
    Json(json!({ "paused": false }))
}
