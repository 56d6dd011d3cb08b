//! Job orchestrator: admission, scheduling and reconciliation

use super::task::{run_job, JobContext, JobSpec};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::jobs::{DownloadJob, JobRegistry};
use crate::storage::{StorageDir, StoredFile};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Semaphore};
use tracing::info;

/// Concurrency and timeout bounds for jobs
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl From<&Settings> for JobLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent_downloads,
            default_timeout: settings.fetch.default_timeout(),
            max_timeout: settings.fetch.max_timeout(),
        }
    }
}

/// Coordinates storage, registry and fetcher for every download
pub struct Orchestrator {
    ctx: JobContext,
    limits: JobLimits,
}

impl Orchestrator {
    pub fn new(
        storage: StorageDir,
        registry: Arc<JobRegistry>,
        fetcher: Arc<dyn Fetcher>,
        limits: JobLimits,
    ) -> Self {
        Self {
            ctx: JobContext {
                storage,
                registry,
                fetcher,
                semaphore: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            },
            limits,
        }
    }

    pub fn storage(&self) -> &StorageDir {
        &self.ctx.storage
    }

    pub fn limits(&self) -> JobLimits {
        self.limits
    }

    /// Admit a download and start it in the background.
    ///
    /// Returns once the job is registered. URL and name problems are rejected
    /// here, before any transfer is started.
    pub fn submit_download(&self, source_url: &str, timeout: Option<Duration>) -> Result<String> {
        let source_url = source_url.trim();
        let target_name = self.ctx.storage.resolve_safe_name(source_url)?;
        let destination = self.ctx.storage.absolute_path(&target_name)?;
        let timeout = timeout
            .unwrap_or(self.limits.default_timeout)
            .min(self.limits.max_timeout);

        let storage = &self.ctx.storage;
        let id = self
            .ctx
            .registry
            .register_unless(source_url, &target_name, |name| storage.exists(name))?;

        info!("Queued job {}: {} -> {}", id, source_url, target_name);

        let spec = JobSpec {
            id: id.clone(),
            source_url: source_url.to_string(),
            target_name,
            destination,
            timeout,
        };
        tokio::spawn(run_job(self.ctx.clone(), spec));

        Ok(id)
    }

    pub fn status(&self, id: &str) -> Result<DownloadJob> {
        self.ctx
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    /// Wait until job `id` reaches a terminal state
    pub async fn wait(&self, id: &str) -> Result<DownloadJob> {
        // Subscribe before reading so no transition slips between the two
        let mut updates = self.ctx.registry.subscribe();

        loop {
            let job = self.status(id)?;
            if job.state.is_terminal() {
                return Ok(job);
            }

            loop {
                match updates.recv().await {
                    Ok(update) if update.id == id && update.state.is_terminal() => return Ok(update),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.status(id),
                }
            }
        }
    }

    /// Job records, newest first
    pub fn jobs(&self, active_only: bool) -> Vec<DownloadJob> {
        if active_only {
            let mut jobs = self.ctx.registry.list_active();
            jobs.reverse();
            jobs
        } else {
            self.ctx.registry.list_all()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadJob> {
        self.ctx.registry.subscribe()
    }

    pub async fn list_files(&self) -> Result<Vec<StoredFile>> {
        self.ctx.storage.list().await
    }

    pub async fn stored_file(&self, name: &str) -> Result<StoredFile> {
        self.ctx.storage.stat(name).await
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        self.ctx.storage.delete(name).await?;
        info!("Deleted {}", name);
        Ok(())
    }
}
