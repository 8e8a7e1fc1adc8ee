//! CLI configuration loading

use anyhow::{Context, Result};
use fedserve::config::EngineConfig;
use std::path::{Path, PathBuf};

/// Load the engine configuration.
///
/// An explicit path must exist. Without one, the default location is used
/// when present; otherwise defaults plus environment overrides apply.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = path {
        return EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()));
    }

    match default_config_path() {
        Some(path) if path.exists() => EngineConfig::from_file(&path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        _ => EngineConfig::from_env().context("Invalid configuration from environment"),
    }
}

/// `<config dir>/fedserve/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fedserve").join("config.yaml"))
}
