//! Run the daemon in the foreground

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use mailwatch_cli::{logging, Daemon, DaemonLock};

pub async fn run(config_path: Option<&Path>, verbosity: u8) -> Result<()> {
    // 1. Configuration errors are fatal before anything starts
    let (path, config) = super::load_config(config_path)?;
    let _guard = logging::init(&config.log, verbosity)?;
    info!(config = %path.display(), "Loaded configuration");

    // 2. One daemon per user
    let lock_dir = DaemonLock::default_dir()?;
    let lock = DaemonLock::acquire(&lock_dir).context("Failed to take the daemon lock")?;

    // 3. Watch until SIGINT/SIGTERM
    let daemon = Daemon::start(&config)?;
    let clean = daemon.run_until_signal().await?;

    lock.release()?;
    if !clean {
        warn!("Exiting with sync commands still running");
    }
    Ok(())
}
