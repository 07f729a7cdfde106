//! Configuration file commands
//!
//! `path` and `init` honor `--config`; `example` prints the annotated
//! default file.

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;

use mailwatch_core::config;

/// Show the config file path
pub async fn run_path(config_path: Option<&Path>) -> Result<()> {
    let path = super::config_path(config_path)?;

    println!("{}", path.display());
    if !path.exists() {
        println!(
            "{}",
            "File does not exist. Use 'mailwatch config init' to create it.".yellow()
        );
    }

    Ok(())
}

/// Create the config file from the example unless it exists
pub async fn run_init(config_path: Option<&Path>) -> Result<()> {
    let path = super::config_path(config_path)?;

    if config::init_if_missing(&path).context("Failed to create config file")? {
        println!("{} Created config file at: {}", "✓".green(), path.display());
        println!(
            "{}",
            "Edit the [[account]] entries, then run 'mailwatch check'.".yellow()
        );
    } else {
        println!("{} already exists", path.display());
    }

    Ok(())
}

/// Show example configuration
pub async fn run_example() -> Result<()> {
    print!("{}", config::example_config());
    Ok(())
}
