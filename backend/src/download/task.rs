//! Per-job unit of work

use crate::error::{FetchErrorKind, FetchFailure};
use crate::fetch::{Fetcher, Progress};
use crate::jobs::JobRegistry;
use crate::storage::StorageDir;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Shared handles a job needs while it runs
#[derive(Clone)]
pub struct JobContext {
    pub storage: StorageDir,
    pub registry: Arc<JobRegistry>,
    pub fetcher: Arc<dyn Fetcher>,
    pub semaphore: Arc<Semaphore>,
}

/// One admitted transfer
pub struct JobSpec {
    pub id: String,
    pub source_url: String,
    pub target_name: String,
    pub destination: PathBuf,
    pub timeout: Duration,
}

/// Feeds a transfer's byte counts into the registry
struct JobProgress {
    registry: Arc<JobRegistry>,
    id: String,
}

impl Progress for JobProgress {
    fn report(&self, downloaded: u64, total: Option<u64>) {
        self.registry.record_progress(&self.id, downloaded, total);
    }
}

/// Run a queued job to a terminal state.
///
/// The job stays `Queued` until a concurrency permit is free. The registry is
/// only told about success after the fetcher has moved the file into place.
pub async fn run_job(ctx: JobContext, spec: JobSpec) {
    // Acquire semaphore permit
    let permit = Arc::clone(&ctx.semaphore).acquire_owned().await;

    ctx.registry.mark_running(&spec.id);

    let result = match permit {
        Ok(_permit) => {
            info!("Starting job {}: {} -> {}", spec.id, spec.source_url, spec.target_name);
            transfer(&ctx, &spec).await
        }
        Err(_) => Err(FetchFailure::new(
            FetchErrorKind::ProcessError,
            "scheduler is shut down",
        )),
    };

    match result {
        Ok(bytes) => {
            ctx.registry.mark_succeeded(&spec.id, bytes);
            info!("Job {} finished: {} ({} bytes)", spec.id, spec.target_name, bytes);
        }
        Err(failure) => {
            match ctx.storage.discard_partial(&spec.target_name).await {
                Ok(true) => warn!("Removed leftover partial file for {}", spec.target_name),
                Ok(false) => {}
                Err(e) => warn!("Failed to clean up after job {}: {}", spec.id, e),
            }
            warn!("Job {} failed: {}", spec.id, failure);
            ctx.registry.mark_failed(&spec.id, &failure);
        }
    }
}

/// Run the fetch in its own task so a panicking backend still ends the job
async fn transfer(ctx: &JobContext, spec: &JobSpec) -> Result<u64, FetchFailure> {
    let fetcher = Arc::clone(&ctx.fetcher);
    let source_url = spec.source_url.clone();
    let destination = spec.destination.clone();
    let timeout = spec.timeout;
    let progress = JobProgress {
        registry: Arc::clone(&ctx.registry),
        id: spec.id.clone(),
    };

    let handle = tokio::spawn(async move {
        fetcher
            .fetch(&source_url, &destination, timeout, &progress)
            .await
    });

    match handle.await {
        Ok(result) => result,
        Err(e) => Err(FetchFailure::new(
            FetchErrorKind::ProcessError,
            if e.is_panic() {
                "transfer task panicked"
            } else {
                "transfer task was cancelled"
            },
        )),
    }
}
