//! Configuration management for Fetch Depot

mod settings;

pub use settings::*;

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the configuration file location
pub const CONFIG_ENV: &str = "FETCH_DEPOT_CONFIG";

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fetch-depot")
}

/// Get the configuration file path
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_dir().join("config.toml"),
    }
}

/// Load configuration from file or create default
pub fn load_or_create_default() -> Result<Settings> {
    load_or_create_at(&config_path())
}

/// Load configuration from `path`, writing the defaults there if it is missing
pub fn load_or_create_at(path: &Path) -> Result<Settings> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    } else {
        let settings = Settings::default();
        save_at(&settings, path)?;
        Ok(settings)
    }
}

/// Save configuration to `path`
pub fn save_at(settings: &Settings, path: &Path) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)?;

    Ok(())
}
