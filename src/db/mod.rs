//! SQLite persistence for jobs and recording sessions.
//!
//! Raw SQL with rusqlite, no ORM. A single connection is shared behind a
//! mutex; every statement is short so callers hold the lock briefly.

pub mod init;
pub mod jobs;
pub mod sessions;

pub use init::{migrate, Database};
pub use jobs::JobRepository;
pub use sessions::SessionRepository;

use chrono::{DateTime, Utc};

/// Decode an optional RFC 3339 column.
pub(crate) fn parse_time(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| rusqlite::Error::InvalidQuery)
        })
        .transpose()
}
