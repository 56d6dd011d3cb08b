//! In-memory job registry with an optional SQLite journal

use super::{DownloadJob, JobState};
use crate::db::Database;
use crate::error::{ConflictReason, Error, FetchErrorKind, FetchFailure, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, DownloadJob>,

    /// Target name -> id of the queued or running job that owns it
    active: HashMap<String, String>,
}

/// Tracks every job by id and enforces one active job per target name
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    journal: Option<Database>,
    updates: broadcast::Sender<DownloadJob>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Create an empty registry that keeps records in memory only
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(1000);
        Self {
            inner: Mutex::new(RegistryInner::default()),
            journal: None,
            updates,
        }
    }

    /// Create a registry backed by `db`, restoring earlier records.
    ///
    /// Jobs a previous process left queued or running are marked failed.
    pub fn with_journal(db: Database) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let mut interrupted = 0;

        {
            let inner = registry.inner.get_mut();
            for mut job in db.get_all_jobs()? {
                if job.is_active() {
                    job.state = JobState::Failed;
                    job.error_kind = Some(FetchErrorKind::ProcessError);
                    job.error_detail = Some("interrupted by restart".to_string());
                    job.completed_at = Some(Utc::now());
                    db.upsert_job(&job)?;
                    interrupted += 1;
                }
                inner.jobs.insert(job.id.clone(), job);
            }
            info!(
                "Restored {} job records ({} interrupted)",
                inner.jobs.len(),
                interrupted
            );
        }

        registry.journal = Some(db);
        Ok(registry)
    }

    /// Subscribe to job state changes
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadJob> {
        self.updates.subscribe()
    }

    /// Admit a new queued job for `target_name`
    #[cfg(test)]
    pub fn register(&self, source_url: &str, target_name: &str) -> Result<String> {
        self.register_unless(source_url, target_name, |_| false)
    }

    /// Admit a new queued job unless `occupied(target_name)` holds.
    ///
    /// The active-name check, the `occupied` check and the insert happen under
    /// one lock, so concurrent submissions for a name admit at most one job.
    /// `occupied` runs synchronously while the lock is held; keep it to a
    /// single metadata lookup and never block on I/O of unbounded length.
    pub fn register_unless(
        &self,
        source_url: &str,
        target_name: &str,
        occupied: impl FnOnce(&str) -> bool,
    ) -> Result<String> {
        let job = {
            let mut inner = self.inner.lock();

            if let Some(owner) = inner.active.get(target_name) {
                return Err(Error::Conflict {
                    name: target_name.to_string(),
                    reason: ConflictReason::Active {
                        job_id: owner.clone(),
                    },
                });
            }
            if occupied(target_name) {
                return Err(Error::Conflict {
                    name: target_name.to_string(),
                    reason: ConflictReason::Exists,
                });
            }

            let job = DownloadJob::new(source_url.to_string(), target_name.to_string());
            inner
                .active
                .insert(job.target_name.clone(), job.id.clone());
            inner.jobs.insert(job.id.clone(), job.clone());
            job
        };

        let id = job.id.clone();
        self.publish(job);
        Ok(id)
    }

    pub fn mark_running(&self, id: &str) {
        self.transition(id, JobState::Running, |job| {
            job.started_at = Some(Utc::now());
        });
    }

    pub fn mark_succeeded(&self, id: &str, bytes: u64) {
        self.transition(id, JobState::Succeeded, |job| {
            job.bytes_transferred = bytes;
            job.completed_at = Some(Utc::now());
        });
    }

    pub fn mark_failed(&self, id: &str, failure: &FetchFailure) {
        self.transition(id, JobState::Failed, |job| {
            job.error_kind = Some(failure.kind);
            job.error_detail = Some(failure.message.clone());
            job.completed_at = Some(Utc::now());
        });
    }

    /// Record bytes written so far by a running job and notify subscribers.
    ///
    /// Reports for jobs that are not running are dropped. Progress is only
    /// broadcast; the journal keeps the count written by the terminal state.
    pub fn record_progress(&self, id: &str, downloaded: u64, total: Option<u64>) {
        let snapshot = {
            let mut inner = self.inner.lock();
            match inner.jobs.get_mut(id) {
                Some(job) if job.state == JobState::Running => {
                    job.bytes_transferred = downloaded;
                    if total.is_some() {
                        job.total_bytes = total;
                    }
                    job.clone()
                }
                _ => return,
            }
        };

        let _ = self.updates.send(snapshot);
    }

    pub fn get(&self, id: &str) -> Option<DownloadJob> {
        self.inner.lock().jobs.get(id).cloned()
    }

    /// Jobs not yet terminal, oldest first
    pub fn list_active(&self) -> Vec<DownloadJob> {
        let inner = self.inner.lock();
        let mut jobs: Vec<DownloadJob> = inner
            .active
            .values()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Every known job, newest first
    pub fn list_all(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Move job `id` to `next`.
    ///
    /// # Panics
    ///
    /// If the job is unknown or `next` is not reachable from its current
    /// state; both mean the orchestrator lost track of its own job.
    fn transition(&self, id: &str, next: JobState, apply: impl FnOnce(&mut DownloadJob)) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let Some(job) = inner.jobs.get_mut(id) else {
                panic!("state change for unknown job {}", id);
            };
            assert!(
                job.state.can_become(next),
                "invalid transition {} -> {} for job {}",
                job.state.as_str(),
                next.as_str(),
                id
            );

            job.state = next;
            apply(job);
            let snapshot = job.clone();

            if next.is_terminal() {
                inner.active.remove(&snapshot.target_name);
            }
            snapshot
        };

        self.publish(snapshot);
    }

    /// Journal `job`, then broadcast it.
    ///
    /// The journal write is a single-row upsert on the calling thread, so a
    /// subscriber never sees a state the journal does not hold yet.
    fn publish(&self, job: DownloadJob) {
        if let Some(db) = &self.journal {
            if let Err(e) = db.upsert_job(&job) {
                warn!("Failed to journal job {}: {}", job.id, e);
            }
        }
        // No subscribers is fine
        let _ = self.updates.send(job);
    }
}
