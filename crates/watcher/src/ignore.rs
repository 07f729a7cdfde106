//! Ignore rules for paths below an account root
//!
//! Two sources of rules:
//! 1. Built-in maildir bookkeeping (always active): Dovecot, Courier and
//!    mbsync state files, lock files, temporary files
//! 2. Exclude patterns from config (gitignore syntax, matched against the
//!    logical folder path, global patterns first, then per-account ones)

use ::ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

use crate::WatchError;

/// Ignore rule manager for one account
pub struct IgnoreRules {
    /// Compiled exclude patterns (None when no pattern is configured)
    exclude: Option<Gitignore>,
}

impl IgnoreRules {
    /// Compile the exclude patterns for an account
    pub fn load(account: &str, root: &Path, patterns: &[String]) -> Result<Self, WatchError> {
        if patterns.is_empty() {
            return Ok(Self { exclude: None });
        }

        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|source| WatchError::Pattern {
                    account: account.to_string(),
                    pattern: pattern.clone(),
                    source,
                })?;
        }
        let exclude = builder.build().map_err(|source| WatchError::Pattern {
            account: account.to_string(),
            pattern: patterns.join(", "),
            source,
        })?;

        Ok(Self {
            exclude: Some(exclude),
        })
    }

    /// Check if a folder (logical `/`-separated path) is excluded
    ///
    /// A pattern matching a parent folder excludes its subfolders too.
    pub fn is_excluded(&self, folder: &str) -> bool {
        // The matcher only accepts paths relative to the root
        let folder = Path::new(folder.trim_start_matches('/'));
        match &self.exclude {
            Some(exclude) => exclude.matched_path_or_any_parents(folder, true).is_ignore(),
            None => false,
        }
    }
}

/// Maildir state files living next to `cur/new/tmp`
///
/// These change on every sync and would otherwise trigger the sync that
/// wrote them.
pub fn is_bookkeeping(name: &str) -> bool {
    // Dovecot: dovecot-uidlist, dovecot-keywords, dovecot.index*, dovecot.list.index*
    if name.starts_with("dovecot") {
        return true;
    }

    // Courier: courierimapuiddb, courierimapkeywords/, courierimapacl
    if name.starts_with("courierimap") {
        return true;
    }

    // mbsync/isync state
    if name.starts_with(".mbsyncstate") || name.starts_with(".isyncuidmap") || name == ".uidvalidity" {
        return true;
    }

    // Maildir++ markers
    if name == "maildirfolder" || name == "subscriptions" {
        return true;
    }

    is_temp_file(name)
}

/// Lock and temporary files, wherever they appear
pub fn is_temp_file(name: &str) -> bool {
    name.ends_with(".lock")
        || name.ends_with('~')
        || name.starts_with(".temp")
        || name.starts_with(".nfs")
        || name.starts_with(".#")
}

/// Entries inside `cur`/`new` that are not messages
///
/// Message file names never start with a dot; everything hidden is a
/// lock or temp file of some delivery agent.
pub fn is_hidden_entry(name: &str) -> bool {
    name.starts_with('.') || is_temp_file(name)
}
