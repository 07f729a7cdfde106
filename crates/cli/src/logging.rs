//! Tracing subscriber setup

use anyhow::{Context, Result};
use mailwatch_core::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins when set. Otherwise the configured level is raised one
/// step per `-v`. Keep the returned guard alive until exit so buffered file
/// output is flushed.
pub fn init(config: &LogConfig, verbosity: u8) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(effective_level(&config.level, verbosity)))
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Raise `level` by `verbosity` steps, saturating at trace
///
/// Anything that is not a plain level name (a directive list such as
/// `mailwatch=debug,info`) is passed through untouched.
pub fn effective_level(level: &str, verbosity: u8) -> String {
    let normalized = level.trim().to_ascii_lowercase();
    match LEVELS.iter().position(|candidate| *candidate == normalized) {
        Some(index) => {
            let raised = (index + verbosity as usize).min(LEVELS.len() - 1);
            LEVELS[raised].to_string()
        }
        None if verbosity == 0 => level.to_string(),
        None => LEVELS[(2 + verbosity as usize).min(LEVELS.len() - 1)].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level() {
        assert_eq!(effective_level("info", 0), "info");
        assert_eq!(effective_level("info", 1), "debug");
        assert_eq!(effective_level("INFO", 2), "trace");
        assert_eq!(effective_level("warn", 9), "trace");
        assert_eq!(effective_level("error", 1), "warn");
    }

    #[test]
    fn test_directives_pass_through() {
        assert_eq!(effective_level("mailwatch=debug,info", 0), "mailwatch=debug,info");
        assert_eq!(effective_level("mailwatch=debug,info", 1), "debug");
    }
}
