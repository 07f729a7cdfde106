//! Validate the configuration and print what the daemon would do

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;

use mailwatch_core::{FolderLayout, SyncKey, INBOX};

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let (path, config) = super::load_config(config_path)?;
    let template = config.command.template().context("Invalid command template")?;
    // Exclude patterns only compile inside the resolver
    mailwatch_watcher::IdentityResolver::new(&config).context("Invalid exclude pattern")?;

    println!("{} {}", "✓".green(), "Configuration is valid".bold());
    println!("{}: {}\n", "Location".dimmed(), path.display().dimmed());

    println!("{}", "[daemon]".yellow());
    let daemon = &config.daemon;
    println!(
        "  {} = {} {}",
        "quiet_period_ms".cyan(),
        daemon.quiet_period_ms,
        format!("({:.1}s)", daemon.quiet_period().as_secs_f64()).dimmed()
    );
    match daemon.max_burst_ms {
        Some(ms) => println!("  {} = {}", "max_burst_ms".cyan(), ms),
        None => println!("  {} = {}", "max_burst_ms".cyan(), "(unbounded)".dimmed()),
    }
    println!("  {} = {}", "max_concurrency".cyan(), daemon.max_concurrency);
    println!("  {} = {}", "shutdown_grace_secs".cyan(), daemon.shutdown_grace_secs);
    println!("  {} = {}", "sync_on_startup".cyan(), daemon.sync_on_startup);

    println!("\n{}", "[command]".yellow());
    println!("  {} {}", "program:".cyan(), template.program());
    if let Some(secs) = config.command.timeout_secs {
        println!("  {} {}s", "timeout:".cyan(), secs);
    }

    if !config.watch.exclude.is_empty() {
        println!("\n{}", "[watch]".yellow());
        println!("  {} {}", "exclude:".cyan(), config.watch.exclude.join(", "));
    }

    let schedule = &config.schedule;
    if schedule.inbox_interval_secs.is_some() || schedule.account_interval_secs.is_some() {
        println!("\n{}", "[schedule]".yellow());
        if let Some(secs) = schedule.inbox_interval_secs {
            println!("  {} every {}s", "INBOX:".cyan(), secs);
        }
        if let Some(secs) = schedule.account_interval_secs {
            println!("  {} every {}s", "account:".cyan(), secs);
        }
    }

    for account in &config.accounts {
        println!("\n{} {}", "[account]".yellow(), account.name.bold());

        let root = account.root.display().to_string();
        if account.root.is_dir() {
            println!("  {} {}", "root:".cyan(), root);
        } else {
            println!("  {} {} {}", "root:".cyan(), root, "(missing, will be retried)".red());
        }

        let layout = match account.layout {
            FolderLayout::Fs => "fs",
            FolderLayout::MaildirPlusPlus => "maildir++",
            FolderLayout::Dbox => "dbox",
        };
        println!("  {} {}", "layout:".cyan(), layout);
        println!("  {} {}", "utf7:".cyan(), account.utf7);
        println!(
            "  {} {}ms{}",
            "quiet period:".cyan(),
            account.quiet_period(daemon).as_millis(),
            if account.quiet_period_ms.is_some() {
                " (override)".dimmed().to_string()
            } else {
                String::new()
            }
        );
        if !account.exclude.is_empty() {
            println!("  {} {}", "exclude:".cyan(), account.exclude.join(", "));
        }

        let folder = template.render(&SyncKey::folder(account.name.as_str(), INBOX));
        let whole = template.render(&SyncKey::account(account.name.as_str()));
        println!("  {} {}", "folder sync:".cyan(), folder);
        println!("  {} {}", "account sync:".cyan(), whole);
    }

    Ok(())
}
