//! Synchronization keys
//!
//! A key identifies one independent unit of debouncing and dispatch: a
//! folder of an account, or the whole account.

use std::fmt;
use std::sync::Arc;

/// Name of the folder living directly in the account root
pub const INBOX: &str = "INBOX";

/// Folder path relative to the account root
///
/// Always `/`-separated and already decoded to UTF-8, independent of the
/// on-disk layout. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderPath(Arc<str>);

impl FolderPath {
    pub fn new(path: impl Into<Arc<str>>) -> Self {
        Self(path.into())
    }

    pub fn inbox() -> Self {
        Self::new(INBOX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_inbox(&self) -> bool {
        &*self.0 == INBOX
    }
}

impl From<&str> for FolderPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FolderPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a synchronization run covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// A single folder
    Folder(FolderPath),
    /// Every folder of the account (startup, scheduled refresh, overflow)
    Account,
}

/// (account, folder) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub account: Arc<str>,
    pub scope: SyncScope,
}

impl SyncKey {
    pub fn folder(account: impl Into<Arc<str>>, folder: impl Into<FolderPath>) -> Self {
        Self {
            account: account.into(),
            scope: SyncScope::Folder(folder.into()),
        }
    }

    pub fn account(account: impl Into<Arc<str>>) -> Self {
        Self {
            account: account.into(),
            scope: SyncScope::Account,
        }
    }

    /// Folder of this key, `None` for account-wide keys
    pub fn folder_path(&self) -> Option<&FolderPath> {
        match &self.scope {
            SyncScope::Folder(folder) => Some(folder),
            SyncScope::Account => None,
        }
    }

    pub fn is_account_wide(&self) -> bool {
        matches!(self.scope, SyncScope::Account)
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            SyncScope::Folder(folder) => write!(f, "{}/{}", self.account, folder),
            SyncScope::Account => write!(f, "{}/*", self.account),
        }
    }
}
