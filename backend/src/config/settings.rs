//! Settings data structures

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum number of concurrent transfers
    pub max_concurrent_downloads: usize,

    /// Server configuration
    pub server: ServerSettings,

    /// Managed download directory
    pub storage: StorageSettings,

    /// Transfer backend configuration
    pub fetch: FetchSettings,

    /// Job record bookkeeping
    pub jobs: JobSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            fetch: FetchSettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

impl Settings {
    /// Reject values that would leave the service unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be at least 1");
        }
        if self.fetch.max_timeout_secs < self.fetch.timeout_secs {
            bail!("fetch.max_timeout_secs must not be below fetch.timeout_secs");
        }
        if self.fetch.backend == FetchBackend::Custom {
            if self.fetch.program.is_none() {
                bail!("fetch.program is required for the custom backend");
            }
            if !self.fetch.args.iter().any(|a| a == "{output}") {
                bail!("fetch.args must contain an \"{{output}}\" argument for the custom backend");
            }
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind to (0.0.0.0 for LAN access)
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Storage directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory that holds fetched files; created at startup
    pub directory: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("downloads"),
        }
    }
}

/// Which transfer implementation runs a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    Wget,
    Curl,
    /// In-process HTTP client
    Http,
    /// Any program, driven by `fetch.args`
    Custom,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub backend: FetchBackend,

    /// Binary to run; looked up on PATH when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Argument template for the custom backend (`{url}`, `{output}`)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Default per-job timeout
    pub timeout_secs: u64,

    /// Upper bound for a caller-supplied timeout
    pub max_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            backend: FetchBackend::Wget,
            program: None,
            args: Vec::new(),
            timeout_secs: 600,
            max_timeout_secs: 3600,
            user_agent: format!("fetch-depot/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

/// Job record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Journal job records to SQLite so status survives a restart
    pub persist: bool,

    /// Journal location; defaults to `jobs.db` in the config directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            persist: true,
            database: None,
        }
    }
}

impl JobSettings {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| super::config_dir().join("jobs.db"))
    }
}
