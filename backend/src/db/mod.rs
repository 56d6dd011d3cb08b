//! SQLite journal for job records

mod schema;

use crate::jobs::DownloadJob;
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for SQLite operations
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the journal at `path`
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Self::from_connection(Connection::open(path)?)
    }

    /// Journal that lives only as long as this handle
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a job record or overwrite the stored copy
    pub fn upsert_job(&self, job: &DownloadJob) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO jobs (
                id, source_url, target_name, state, bytes_transferred,
                error_kind, error_detail, created_at, started_at, completed_at,
                total_bytes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                bytes_transferred = excluded.bytes_transferred,
                total_bytes = excluded.total_bytes,
                error_kind = excluded.error_kind,
                error_detail = excluded.error_detail,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
            rusqlite::params![
                job.id,
                job.source_url,
                job.target_name,
                job.state.as_str(),
                i64::try_from(job.bytes_transferred).unwrap_or(i64::MAX),
                job.error_kind.map(|k| k.as_str()),
                job.error_detail,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.total_bytes.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            ],
        )?;

        Ok(())
    }

    /// Get all job records, oldest first
    pub fn get_all_jobs(&self) -> Result<Vec<DownloadJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC", schema::SELECT_COLUMNS))?;
        let jobs = stmt
            .query_map([], schema::job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }
}
