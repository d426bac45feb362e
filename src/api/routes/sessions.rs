//! Recording session API endpoints.
//!
//! Provides HTTP endpoints for:
//! - Listing and inspecting sessions (GET /sessions, GET /sessions/:id)
//! - Starting and stopping recording (POST /sessions/start, POST /sessions/:id/stop)
//! - Adding markers (POST /sessions/:id/markers)
//! - Answering scheduled stop prompts (GET /confirmations, POST /confirmations/:id)

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::calendar::AutoTaskConfig;
use crate::notify::StopDecision;
use crate::session::{SessionOptions, StartRequest};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartSessionRequest {
    pub title: Option<String>,
    pub event_id: Option<String>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub enable_transcription: Option<bool>,
    pub enable_recording: Option<bool>,
    pub enable_translation: Option<bool>,
    pub target_language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkerRequest {
    pub label: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/start", post(start_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/stop", post(stop_session))
        .route("/sessions/:id/markers", post(add_marker))
        .route("/confirmations", get(list_confirmations))
        .route("/confirmations/:session_id", post(answer_confirmation))
        .with_state(state)
}

async fn list_sessions(State(state): State<ApiState>) -> Json<Value> {
    let sessions = state.sessions.list().await;
    Json(json!({ "sessions": sessions }))
}

async fn start_session(
    State(state): State<ApiState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<Json<Value>> {
    let overrides = AutoTaskConfig {
        enable_transcription: request.enable_transcription,
        enable_recording: request.enable_recording,
        enable_translation: request.enable_translation,
        target_language: request.target_language,
    };
    let options = SessionOptions::from(&state.defaults).merged_with(&overrides);
    if !options.enable_recording && !options.enable_transcription {
        return Err(ApiError::bad_request(
            "Session would neither record nor transcribe",
        ));
    }

    info!("Session start requested via API");
    let session = state
        .sessions
        .start(StartRequest {
            event_id: request.event_id,
            title: request.title,
            scheduled_end: request.scheduled_end,
            options,
        })
        .await?;

    Ok(Json(json!({ "success": true, "session": session })))
}

async fn get_session(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get(id).await?;
    Ok(Json(json!(session)))
}

async fn stop_session(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> ApiResult<Json<Value>> {
    info!("Stop requested via API for session {}", id);
    let session = state.sessions.stop(id).await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

async fn add_marker(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
    Json(request): Json<MarkerRequest>,
) -> ApiResult<Json<Value>> {
    let label = request.label.trim();
    if label.is_empty() {
        return Err(ApiError::bad_request("label must not be empty"));
    }
    let marker = state.sessions.add_marker(id, label).await?;
    Ok(Json(json!(marker)))
}

async fn list_confirmations(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "pending": state.notifier.pending() }))
}

async fn answer_confirmation(
    Path(session_id): Path<Uuid>,
    State(state): State<ApiState>,
    Json(decision): Json<StopDecision>,
) -> ApiResult<Json<Value>> {
    if !state.notifier.answer(session_id, decision) {
        return Err(ApiError::not_found(format!(
            "No stop confirmation pending for session {session_id}"
        )));
    }
    info!("Stop prompt for session {} answered: {:?}", session_id, decision);
    Ok(Json(json!({ "success": true, "decision": decision })))
}
