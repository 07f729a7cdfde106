//! Filesystem events before and after identity resolution

use std::path::PathBuf;
use tokio::time::Instant;

use crate::key::SyncKey;

/// Type of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entry created
    Created,
    /// Entry deleted
    Removed,
    /// Entry renamed (maildir flag changes and `new` -> `cur` moves)
    Renamed,
    /// Entry content or metadata modified
    Modified,
    /// The notification backend dropped events below this path
    Overflow,
}

/// What the changed path was, as far as the watcher could tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Gone before it could be inspected
    Unknown,
}

/// Event as produced by the watch source
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Absolute path that changed
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub entry: EntryKind,
    /// When the watcher observed the change
    pub at: Instant,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind, entry: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
            entry,
            at: Instant::now(),
        }
    }
}

/// Event attributed to a synchronization key
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub key: SyncKey,
    pub at: Instant,
}

impl ResolvedEvent {
    pub fn new(key: SyncKey, at: Instant) -> Self {
        Self { key, at }
    }

    /// Event observed right now (tests, manual triggers)
    pub fn now(key: SyncKey) -> Self {
        Self::new(key, Instant::now())
    }
}
