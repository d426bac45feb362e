//! Job record persistence.
//!
//! CRUD operations for the `jobs` table. Timestamps are stored as RFC 3339
//! text so rows sort and compare lexically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::PathBuf;
use uuid::Uuid;

use super::parse_time;

use crate::config::OrphanedJobPolicy;
use crate::queue::{Job, JobStatus};

const JOB_COLUMNS: &str = "id, input, status, progress, retry_count, cancel_requested, \
                           output, error, created_at, started_at, completed_at";

/// Repository for job records.
pub struct JobRepository;

impl JobRepository {
    /// Insert or replace the full job row.
    pub fn upsert(conn: &Connection, job: &Job) -> Result<()> {
        conn.execute(
            "INSERT INTO jobs (id, input, status, progress, retry_count, cancel_requested, \
             output, error, created_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, \
             progress = excluded.progress, retry_count = excluded.retry_count, \
             cancel_requested = excluded.cancel_requested, output = excluded.output, \
             error = excluded.error, started_at = excluded.started_at, \
             completed_at = excluded.completed_at",
            params![
                job.id.to_string(),
                job.input.to_string_lossy().to_string(),
                job.status.as_str(),
                job.progress,
                job.retry_count,
                job.cancel_requested,
                job.output.as_ref().map(|p| p.to_string_lossy().to_string()),
                job.error,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .with_context(|| format!("Failed to save job {}", job.id))?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Job>> {
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .context("Failed to prepare job query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], map_job_row)
            .context("Failed to query job")?;

        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List jobs, newest first.
    pub fn list(conn: &Connection, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"
            ))
            .context("Failed to prepare jobs list query")?;

        let jobs = stmt
            .query_map(params![limit as i64], map_job_row)
            .context("Failed to list jobs")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map jobs")?;

        Ok(jobs)
    }

    /// Pending jobs in enqueue order.
    pub fn list_pending(conn: &Connection) -> Result<Vec<Job>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC"
            ))
            .context("Failed to prepare pending jobs query")?;

        let jobs = stmt
            .query_map(params![JobStatus::Pending.as_str()], map_job_row)
            .context("Failed to list pending jobs")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map pending jobs")?;

        Ok(jobs)
    }

    /// Jobs left `processing` by a previous process have no live worker.
    /// Returns how many rows were reconciled.
    pub fn reconcile_orphaned(conn: &Connection, policy: OrphanedJobPolicy) -> Result<usize> {
        let changed = match policy {
            OrphanedJobPolicy::Fail => conn
                .execute(
                    "UPDATE jobs SET status = ?1, error = ?2, completed_at = ?3 WHERE status = ?4",
                    params![
                        JobStatus::Failed.as_str(),
                        "Interrupted by service restart",
                        Utc::now().to_rfc3339(),
                        JobStatus::Processing.as_str(),
                    ],
                )
                .context("Failed to fail orphaned jobs")?,
            OrphanedJobPolicy::Requeue => conn
                .execute(
                    "UPDATE jobs SET status = ?1, progress = 0, started_at = NULL WHERE status = ?2",
                    params![JobStatus::Pending.as_str(), JobStatus::Processing.as_str()],
                )
                .context("Failed to requeue orphaned jobs")?,
        };
        Ok(changed)
    }

    pub fn delete(conn: &Connection, id: Uuid) -> Result<()> {
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete job")?;
        Ok(())
    }

    /// Delete terminal jobs that completed before `cutoff`.
    pub fn prune_terminal(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = conn
            .execute(
                "DELETE FROM jobs WHERE status IN (?1, ?2, ?3) AND completed_at < ?4",
                params![
                    JobStatus::Cancelled.as_str(),
                    JobStatus::Completed.as_str(),
                    JobStatus::Failed.as_str(),
                    cutoff.to_rfc3339(),
                ],
            )
            .context("Failed to prune terminal jobs")?;
        Ok(deleted)
    }
}

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let input: String = row.get(1)?;
    let status: String = row.get(2)?;
    let output: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::InvalidQuery)?,
        input: PathBuf::from(input),
        status: JobStatus::parse(&status).map_err(|_| rusqlite::Error::InvalidQuery)?,
        progress: row.get(3)?,
        retry_count: row.get(4)?,
        cancel_requested: row.get(5)?,
        output: output.map(PathBuf::from),
        error: row.get(7)?,
        created_at: parse_time(Some(created_at))?.unwrap_or_else(Utc::now),
        started_at: parse_time(row.get(9)?)?,
        completed_at: parse_time(row.get(10)?)?,
    })
}
