//! Fetch Depot - a download service with a managed file directory
//!
//! Accepts download requests over HTTP, runs the transfers in the background
//! and serves the finished files back from a single flat directory.

mod config;
mod db;
mod download;
mod error;
mod fetch;
mod jobs;
mod server;
mod storage;

#[cfg(test)]
mod test_helpers;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Settings;
use crate::db::Database;
use crate::download::{JobLimits, Orchestrator};
use crate::jobs::JobRegistry;
use crate::storage::StorageDir;

/// Application state shared across all components
pub struct AppState {
    pub settings: Settings,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(settings: Settings, orchestrator: Orchestrator) -> Self {
        Self {
            settings,
            orchestrator,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Fetch Depot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = config::load_or_create_default().with_context(|| {
        format!(
            "failed to load configuration from {}",
            config::config_path().display()
        )
    })?;
    info!("Configuration loaded from {:?}", config::config_path());

    // Open the storage directory and clear leftovers of interrupted transfers
    let storage = StorageDir::open(&settings.storage.directory).with_context(|| {
        format!(
            "failed to open storage directory {}",
            settings.storage.directory.display()
        )
    })?;
    let swept = storage.sweep_partials().await?;
    if swept > 0 {
        info!("Removed {} partial file(s)", swept);
    }
    info!("Storing files in {}", storage.root().display());

    // Job registry, journaled when persistence is enabled
    let registry = if settings.jobs.persist {
        let path = settings.jobs.database_path();
        let db = Database::open(&path)
            .with_context(|| format!("failed to open job journal {}", path.display()))?;
        info!("Job journal at {}", path.display());
        JobRegistry::with_journal(db)?
    } else {
        JobRegistry::new()
    };

    let fetcher = fetch::from_settings(&settings.fetch, storage.clone())?;
    let orchestrator = Orchestrator::new(
        storage,
        Arc::new(registry),
        fetcher,
        JobLimits::from(&settings),
    );

    let state = Arc::new(AppState::new(settings, orchestrator));
    server::run(state).await
}
