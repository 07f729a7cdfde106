//! Shared types for mailwatch
//!
//! This crate provides:
//! - Synchronization keys (account, folder)
//! - Raw and resolved filesystem events
//! - The configuration model and its validation
//! - Command templates with `{account}` / `{folder}` substitution

pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod template;

// Re-exports
pub use config::{AccountConfig, Config, FolderLayout};
pub use error::{ConfigError, TemplateError};
pub use event::{ChangeKind, EntryKind, RawEvent, ResolvedEvent};
pub use key::{FolderPath, SyncKey, SyncScope, INBOX};
pub use template::{CommandLine, CommandTemplate};
