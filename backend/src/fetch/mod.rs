//! Fetch executor: runs one transfer into the storage directory
//!
//! Every backend writes to `<name>.part`, syncs it, and renames it onto the
//! destination only after the transfer finished cleanly. Failed or timed out
//! transfers remove the partial file, so a destination path never holds a
//! truncated download.

mod command;
mod http;

pub use command::{CommandFetcher, ExitCodes};
pub use http::HttpFetcher;

use crate::config::{FetchBackend, FetchSettings};
use crate::error::{FetchErrorKind, FetchFailure};
use crate::storage::{StorageDir, PARTIAL_SUFFIX};
use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tracing::{info, warn};

/// Minimum spacing between two progress reports of one transfer
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Receives the running byte count of a transfer
pub trait Progress: Send + Sync {
    fn report(&self, downloaded: u64, total: Option<u64>);
}

/// A transfer implementation
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve `source_url` into `destination`, returning the byte count.
    ///
    /// `destination` must lie directly inside the storage directory. Bytes
    /// written so far are reported to `progress` while the transfer runs.
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Path,
        timeout: Duration,
        progress: &dyn Progress,
    ) -> Result<u64, FetchFailure>;

    /// Short label for logs
    fn name(&self) -> &'static str;
}

/// Build the fetcher selected in settings
pub fn from_settings(settings: &FetchSettings, storage: StorageDir) -> anyhow::Result<Arc<dyn Fetcher>> {
    let fetcher: Arc<dyn Fetcher> = match settings.backend {
        FetchBackend::Http => Arc::new(HttpFetcher::new(&settings.user_agent, storage)?),
        FetchBackend::Wget => {
            let program = locate(settings.program.as_deref(), "wget")?;
            Arc::new(CommandFetcher::wget(program, &settings.user_agent, storage))
        }
        FetchBackend::Curl => {
            let program = locate(settings.program.as_deref(), "curl")?;
            Arc::new(CommandFetcher::curl(program, &settings.user_agent, storage))
        }
        FetchBackend::Custom => {
            let program = settings
                .program
                .as_deref()
                .context("fetch.program is required for the custom backend")?;
            let program = locate(Some(program), "")?;
            Arc::new(CommandFetcher::new(
                program,
                settings.args.clone(),
                ExitCodes::Generic,
                storage,
            ))
        }
    };

    info!("Using {} fetch backend", fetcher.name());
    Ok(fetcher)
}

fn locate(program: Option<&Path>, default: &str) -> anyhow::Result<PathBuf> {
    let program = program.unwrap_or_else(|| Path::new(default));
    which::which(program).with_context(|| format!("transfer program {} not found", program.display()))
}

/// Passes reports through at most once per [`PROGRESS_INTERVAL`]
struct Throttled<'a> {
    sink: &'a dyn Progress,
    last: Option<Instant>,
}

impl<'a> Throttled<'a> {
    fn new(sink: &'a dyn Progress) -> Self {
        Self { sink, last: None }
    }

    fn report(&mut self, downloaded: u64, total: Option<u64>) {
        if self.last.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL) {
            self.sink.report(downloaded, total);
            self.last = Some(Instant::now());
        }
    }
}

/// Check the destination and clear any leftover partial file
async fn prepare(storage: &StorageDir, destination: &Path) -> Result<PathBuf, FetchFailure> {
    storage
        .confine(destination)
        .map_err(|e| FetchFailure::new(FetchErrorKind::InvalidTarget, e.to_string()))?;

    let mut partial = destination.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    discard(&partial).await;
    Ok(partial)
}

/// Flush the finished partial file to disk and move it onto `destination`
async fn publish(partial: &Path, destination: &Path) -> Result<u64, FetchFailure> {
    let file = OpenOptions::new()
        .write(true)
        .open(partial)
        .await
        .map_err(|e| write_failed("transfer produced no output file", e))?;
    file.sync_all()
        .await
        .map_err(|e| write_failed("failed to sync output", e))?;
    let bytes = file
        .metadata()
        .await
        .map_err(|e| write_failed("failed to stat output", e))?
        .len();
    drop(file);

    tokio::fs::rename(partial, destination)
        .await
        .map_err(|e| write_failed("failed to move output into place", e))?;

    Ok(bytes)
}

/// Remove a partial file, ignoring one that does not exist
async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", partial.display(), e),
    }
}

fn write_failed(context: &str, e: std::io::Error) -> FetchFailure {
    FetchFailure::new(FetchErrorKind::WriteFailed, format!("{}: {}", context, e))
}

fn timed_out(timeout: Duration) -> FetchFailure {
    FetchFailure::new(
        FetchErrorKind::Timeout,
        format!("transfer exceeded {:.1}s timeout", timeout.as_secs_f64()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ProgressLog;

    #[tokio::test]
    async fn prepare_refuses_outside_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path().join("store")).unwrap();

        let outside = dir.path().join("escape.bin");
        let err = prepare(&storage, &outside).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::InvalidTarget);

        let nested = storage.root().join("sub").join("x.bin");
        assert_eq!(
            prepare(&storage, &nested).await.unwrap_err().kind,
            FetchErrorKind::InvalidTarget
        );
    }

    #[tokio::test]
    async fn publish_moves_partial_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path()).unwrap();
        let destination = storage.absolute_path("done.txt").unwrap();

        std::fs::write(storage.partial_path("done.txt").unwrap(), b"stale").unwrap();
        let partial = prepare(&storage, &destination).await.unwrap();
        assert!(!partial.exists());

        std::fs::write(&partial, b"complete").unwrap();
        assert_eq!(publish(&partial, &destination).await.unwrap(), 8);
        assert!(!partial.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn publish_without_output_is_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path()).unwrap();
        let destination = storage.absolute_path("never.txt").unwrap();
        let partial = prepare(&storage, &destination).await.unwrap();

        let err = publish(&partial, &destination).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::WriteFailed);
        assert!(!destination.exists());
    }

    #[test]
    fn throttled_reports_are_spaced_out() {
        let log = ProgressLog::default();
        let mut throttled = Throttled::new(&log);

        throttled.report(1, Some(10));
        throttled.report(2, Some(10));
        assert_eq!(log.reports(), vec![(1, Some(10))]);

        std::thread::sleep(PROGRESS_INTERVAL + Duration::from_millis(20));
        throttled.report(3, Some(10));
        assert_eq!(log.reports(), vec![(1, Some(10)), (3, Some(10))]);
    }

    #[test]
    fn custom_backend_requires_program() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path()).unwrap();
        let settings = FetchSettings {
            backend: FetchBackend::Custom,
            ..FetchSettings::default()
        };
        assert!(from_settings(&settings, storage).is_err());
    }

    #[test]
    fn missing_program_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path()).unwrap();
        let settings = FetchSettings {
            program: Some(PathBuf::from("/nonexistent/fetch-depot-wget")),
            ..FetchSettings::default()
        };
        assert!(from_settings(&settings, storage).is_err());
    }
}
