//! Run the configured sync command once, in the foreground

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use mailwatch_cli::DaemonLock;
use mailwatch_core::SyncKey;
use mailwatch_dispatch::{CommandRunner, Invocation, ProcessRunner};

pub async fn run(config_path: Option<&Path>, account: &str, folder: Option<&str>) -> Result<()> {
    let (_, config) = super::load_config(config_path)?;
    if config.account(account).is_none() {
        let known: Vec<&str> = config.accounts.iter().map(|a| a.name.as_str()).collect();
        anyhow::bail!("Unknown account: {}. Configured: {}", account, known.join(", "));
    }

    let key = match folder {
        Some(folder) => SyncKey::folder(account, folder),
        None => SyncKey::account(account),
    };
    let template = config.command.template().context("Invalid command template")?;
    let command = template.render(&key);
    let invocation = Invocation::new(key, command);

    if DaemonLock::default_dir().is_ok_and(|dir| DaemonLock::is_held(&dir)) {
        eprintln!(
            "{} {}",
            "Warning:".yellow().bold(),
            "the mailwatch daemon is running and may sync the same folder at the same time".yellow()
        );
    }

    println!("{} {}", "Running:".bold(), invocation.command.to_string().cyan());

    // Ctrl-C terminates the command's process group
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let runner = ProcessRunner::new(config.command.timeout());
    let completion = runner.run(&invocation, cancel).await;

    if !completion.stdout.is_empty() {
        print!("{}", completion.stdout);
    }
    if !completion.stderr.is_empty() {
        eprint!("{}", completion.stderr);
    }

    let took = format!("({:.1}s)", completion.duration.as_secs_f64());
    if completion.outcome.is_success() {
        println!("{} {} {}", "✓".green(), invocation.key, took.dimmed());
        Ok(())
    } else {
        anyhow::bail!("Sync of {} failed: {} {}", invocation.key, completion.outcome, took);
    }
}
