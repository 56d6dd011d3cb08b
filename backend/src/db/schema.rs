//! Journal schema and row mapping

use crate::error::FetchErrorKind;
use crate::jobs::{DownloadJob, JobState};
use chrono::{DateTime, Utc};
use rusqlite::Row;

pub(super) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    source_url TEXT NOT NULL,
    target_name TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    error_kind TEXT,
    error_detail TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    total_bytes INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
"#;

pub(super) const SELECT_COLUMNS: &str = r#"
SELECT id, source_url, target_name, state, bytes_transferred,
       error_kind, error_detail, created_at, started_at, completed_at,
       total_bytes
FROM jobs
"#;

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map a row selected with [`SELECT_COLUMNS`]
pub(super) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadJob> {
    let state: String = row.get(3)?;
    let error_kind: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;

    Ok(DownloadJob {
        id: row.get(0)?,
        source_url: row.get(1)?,
        target_name: row.get(2)?,
        // Unknown states only come from a foreign writer; treat them as lost
        state: JobState::from_str(&state).unwrap_or(JobState::Failed),
        bytes_transferred: row.get::<_, i64>(4)?.max(0) as u64,
        error_kind: error_kind.as_deref().and_then(FetchErrorKind::from_str),
        error_detail: row.get(6)?,
        created_at: parse_time(&created_at).unwrap_or_else(Utc::now),
        started_at: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(parse_time),
        completed_at: row
            .get::<_, Option<String>>(9)?
            .as_deref()
            .and_then(parse_time),
        total_bytes: row
            .get::<_, Option<i64>>(10)?
            .map(|n| n.max(0) as u64),
    })
}
