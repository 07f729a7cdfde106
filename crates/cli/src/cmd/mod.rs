//! CLI command implementations

pub mod check;
pub mod config;
pub mod resolve;
pub mod run;
pub mod sync;

use anyhow::{Context, Result};
use mailwatch_core::config::config_file_path;
use mailwatch_core::Config;
use std::path::{Path, PathBuf};

/// The `--config` path, or the default location
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config_file_path().context("Could not determine config file path"),
    }
}

pub fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, Config)> {
    let path = config_path(explicit)?;
    let config = Config::load(&path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok((path, config))
}
