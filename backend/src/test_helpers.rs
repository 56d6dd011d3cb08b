//! Shared fixtures for unit tests

use crate::download::{JobLimits, Orchestrator};
use crate::error::{FetchErrorKind, FetchFailure};
use crate::fetch::{Fetcher, Progress};
use crate::jobs::JobRegistry;
use crate::storage::StorageDir;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fetcher double that writes a fixed body, fails, or panics
pub struct StubFetcher {
    storage: StorageDir,
    body: Vec<u8>,
    failure: Option<FetchErrorKind>,
    panics: bool,
    reports_progress: bool,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn succeeding(storage: StorageDir, body: &[u8]) -> Self {
        Self {
            storage,
            body: body.to_vec(),
            failure: None,
            panics: false,
            reports_progress: false,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(storage: StorageDir, kind: FetchErrorKind) -> Self {
        Self {
            failure: Some(kind),
            ..Self::succeeding(storage, b"")
        }
    }

    pub fn panicking(storage: StorageDir) -> Self {
        Self {
            panics: true,
            ..Self::succeeding(storage, b"")
        }
    }

    /// Hold every transfer until [`release`](Self::release) hands out a permit
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Report half the body as written before waiting on the gate
    pub fn with_progress(mut self) -> Self {
        self.reports_progress = true;
        self
    }

    pub fn release(&self, transfers: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(transfers);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls() < calls {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fetcher was not called in time");
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(
        &self,
        _source_url: &str,
        destination: &Path,
        _timeout: Duration,
        progress: &dyn Progress,
    ) -> Result<u64, FetchFailure> {
        self.storage
            .confine(destination)
            .map_err(|e| FetchFailure::new(FetchErrorKind::InvalidTarget, e.to_string()))?;
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.reports_progress {
            let total = self.body.len() as u64;
            progress.report(total / 2, Some(total));
        }

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| FetchFailure::new(FetchErrorKind::ProcessError, "gate closed"))?
                .forget();
        }
        if self.panics {
            panic!("stub fetcher panicked");
        }
        if let Some(kind) = self.failure {
            return Err(FetchFailure::new(kind, "stub failure"));
        }

        tokio::fs::write(destination, &self.body)
            .await
            .map_err(|e| FetchFailure::new(FetchErrorKind::WriteFailed, e.to_string()))?;
        Ok(self.body.len() as u64)
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Progress sink that keeps every report
#[derive(Default)]
pub struct ProgressLog {
    reports: Mutex<Vec<(u64, Option<u64>)>>,
}

impl ProgressLog {
    pub fn reports(&self) -> Vec<(u64, Option<u64>)> {
        self.reports.lock().clone()
    }
}

impl Progress for ProgressLog {
    fn report(&self, downloaded: u64, total: Option<u64>) {
        self.reports.lock().push((downloaded, total));
    }
}

/// Orchestrator over a fresh temp directory, two transfers at a time
pub fn orchestrator_with(
    make: impl FnOnce(StorageDir) -> StubFetcher,
) -> (Orchestrator, Arc<StubFetcher>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageDir::open(dir.path().join("downloads")).unwrap();
    let fetcher = Arc::new(make(storage.clone()));

    let orchestrator = Orchestrator::new(
        storage,
        Arc::new(JobRegistry::new()),
        fetcher.clone(),
        JobLimits {
            max_concurrent: 2,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(60),
        },
    );

    (orchestrator, fetcher, dir)
}
