//! Recording session persistence.
//!
//! Options and markers are stored as JSON columns; archive paths are plain
//! text columns so they can be listed without decoding.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::path::PathBuf;
use uuid::Uuid;

use super::parse_time;

use crate::session::{RecordingSession, SessionArchive, SessionState};

const SESSION_COLUMNS: &str = "id, event_id, title, state, options, started_at, scheduled_end, \
                               audio_duration_secs, markers, transcript_path, translation_path, \
                               markers_path, error, created_at";

/// Repository for recording session records.
pub struct SessionRepository;

impl SessionRepository {
    pub fn upsert(conn: &Connection, session: &RecordingSession) -> Result<()> {
        let options =
            serde_json::to_string(&session.options).context("Failed to encode session options")?;
        let markers =
            serde_json::to_string(&session.markers).context("Failed to encode session markers")?;
        let archive = session.archive.as_ref();

        conn.execute(
            "INSERT INTO sessions (id, event_id, title, state, options, started_at, scheduled_end, \
             audio_duration_secs, markers, transcript_path, translation_path, markers_path, error, \
             created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, \
             started_at = excluded.started_at, scheduled_end = excluded.scheduled_end, \
             audio_duration_secs = excluded.audio_duration_secs, markers = excluded.markers, \
             transcript_path = excluded.transcript_path, \
             translation_path = excluded.translation_path, \
             markers_path = excluded.markers_path, error = excluded.error",
            params![
                session.id.to_string(),
                session.event_id,
                session.title,
                session.state.as_str(),
                options,
                session.started_at.map(|t| t.to_rfc3339()),
                session.scheduled_end.map(|t| t.to_rfc3339()),
                session.audio_duration_secs,
                markers,
                archive.map(|a| a.transcript_path.to_string_lossy().to_string()),
                archive
                    .and_then(|a| a.translation_path.as_ref())
                    .map(|p| p.to_string_lossy().to_string()),
                archive.map(|a| a.markers_path.to_string_lossy().to_string()),
                session.error,
                session.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save session {}", session.id))?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: Uuid) -> Result<Option<RecordingSession>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))
            .context("Failed to prepare session query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], map_session_row)
            .context("Failed to query session")?;

        match rows.next() {
            Some(Ok(session)) => Ok(Some(session)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List sessions, newest first.
    pub fn list(conn: &Connection, limit: usize) -> Result<Vec<RecordingSession>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC LIMIT ?1"
            ))
            .context("Failed to prepare sessions list query")?;

        let sessions = stmt
            .query_map(params![limit as i64], map_session_row)
            .context("Failed to list sessions")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map sessions")?;

        Ok(sessions)
    }

    /// Sessions that were live when the previous process exited can never
    /// finish; mark them failed.
    pub fn fail_unfinished(conn: &Connection) -> Result<usize> {
        let changed = conn
            .execute(
                "UPDATE sessions SET state = ?1, error = ?2 WHERE state NOT IN (?3, ?4)",
                params![
                    SessionState::Failed.as_str(),
                    "Interrupted by service restart",
                    SessionState::Stopped.as_str(),
                    SessionState::Failed.as_str(),
                ],
            )
            .context("Failed to reconcile unfinished sessions")?;
        Ok(changed)
    }
}

fn map_session_row(row: &Row<'_>) -> rusqlite::Result<RecordingSession> {
    let id: String = row.get(0)?;
    let state: String = row.get(3)?;
    let options: String = row.get(4)?;
    let markers: String = row.get(8)?;
    let transcript_path: Option<String> = row.get(9)?;
    let translation_path: Option<String> = row.get(10)?;
    let markers_path: Option<String> = row.get(11)?;
    let created_at: String = row.get(13)?;

    let archive = match (transcript_path, markers_path) {
        (Some(transcript), Some(markers)) => Some(SessionArchive {
            transcript_path: PathBuf::from(transcript),
            translation_path: translation_path.map(PathBuf::from),
            markers_path: PathBuf::from(markers),
        }),
        _ => None,
    };

    Ok(RecordingSession {
        id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::InvalidQuery)?,
        event_id: row.get(1)?,
        title: row.get(2)?,
        state: SessionState::parse(&state).map_err(|_| rusqlite::Error::InvalidQuery)?,
        options: serde_json::from_str(&options).map_err(|_| rusqlite::Error::InvalidQuery)?,
        started_at: parse_time(row.get(5)?)?,
        scheduled_end: parse_time(row.get(6)?)?,
        audio_duration_secs: row.get(7)?,
        markers: serde_json::from_str(&markers).map_err(|_| rusqlite::Error::InvalidQuery)?,
        translation: None,
        stop_deferrals: 0,
        archive,
        error: row.get(12)?,
        created_at: parse_time(Some(created_at))?.unwrap_or_else(Utc::now),
    })
}
