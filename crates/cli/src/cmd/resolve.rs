//! Resolve command - show which sync key a path maps to
//!
//! Usage:
//!   mailwatch resolve ~/Mail/work/Lists/rust/cur/1700000000.host:2,S
//!   mailwatch resolve --dir ~/Mail/work/Archive/2024

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

use mailwatch_core::{ChangeKind, EntryKind};
use mailwatch_watcher::IdentityResolver;

pub async fn run(config_path: Option<&Path>, paths: &[PathBuf], assume_dir: bool) -> Result<()> {
    let (_, config) = super::load_config(config_path)?;
    let resolver = IdentityResolver::new(&config).context("Invalid exclude pattern")?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    for path in paths {
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        let entry = entry_kind(&absolute, assume_dir);

        match resolver.resolve_path(&absolute, ChangeKind::Created, entry) {
            Ok(key) => println!("{}  {} {}", path.display(), "→".dimmed(), key.to_string().green()),
            Err(reason) => println!(
                "{}  {} {}",
                path.display(),
                "ignored:".yellow(),
                reason.to_string().dimmed()
            ),
        }
    }

    Ok(())
}

fn entry_kind(path: &Path, assume_dir: bool) -> EntryKind {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => EntryKind::Dir,
        Ok(_) => EntryKind::File,
        Err(_) if assume_dir => EntryKind::Dir,
        Err(_) => EntryKind::Unknown,
    }
}
