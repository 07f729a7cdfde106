//! Identity resolution: raw path -> (account, folder)
//!
//! Resolution is a pure function of the path, the change kind and the
//! static account table. Nothing touches the filesystem here, so a folder
//! deleted before its events are resolved is handled like any other path.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use mailwatch_core::{
    AccountConfig, ChangeKind, Config, EntryKind, FolderLayout, FolderPath, RawEvent,
    ResolvedEvent, SyncKey,
};

use crate::ignore::{is_bookkeeping, is_hidden_entry, IgnoreRules};
use crate::WatchError;

/// Maildir leaf directories
const CUR: &str = "cur";
const NEW: &str = "new";
pub(crate) const TMP: &str = "tmp";

/// Dovecot dbox: `Mail/mailboxes/<folder...>/dbox-Mails/<message>`
const DBOX_MAILS: &str = "dbox-Mails";

pub(crate) fn is_leaf(name: &str) -> bool {
    name == CUR || name == NEW || name == TMP
}

/// Why a path did not resolve to a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not below any account root
    OutsideRoots,
    /// The account root directory itself
    AccountRoot,
    /// In or under a `tmp` directory (delivery in progress)
    TempArea,
    /// Hidden, lock or temp file inside `cur`/`new`
    TempFile,
    /// Server or sync tool state file
    Bookkeeping,
    /// File or path that is neither a message nor a folder directory
    NotAFolder,
    /// Hidden directory in a nested layout
    Hidden,
    /// Folder matches an exclude pattern
    Excluded,
    /// Path is not valid UTF-8, or a folder name decodes to something
    /// that cannot be a folder
    Undecodable,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OutsideRoots => "outside every account root",
            Self::AccountRoot => "account root",
            Self::TempArea => "maildir tmp area",
            Self::TempFile => "temporary or lock file",
            Self::Bookkeeping => "bookkeeping file",
            Self::NotAFolder => "not a folder",
            Self::Hidden => "hidden directory",
            Self::Excluded => "excluded folder",
            Self::Undecodable => "undecodable folder name",
        };
        f.write_str(text)
    }
}

/// Result of resolving one raw event
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ResolvedEvent),
    Ignored(IgnoreReason),
}

struct AccountRoot {
    name: Arc<str>,
    root: PathBuf,
    layout: FolderLayout,
    utf7: bool,
    rules: IgnoreRules,
}

/// Maps raw events to synchronization keys
pub struct IdentityResolver {
    /// Sorted by root depth, deepest first, so nested roots win
    accounts: Vec<AccountRoot>,
}

impl IdentityResolver {
    pub fn new(config: &Config) -> Result<Self, WatchError> {
        let mut accounts = config
            .accounts
            .iter()
            .map(|account| Self::account_root(account, &config.watch.exclude))
            .collect::<Result<Vec<_>, _>>()?;

        accounts.sort_by_key(|account| std::cmp::Reverse(account.root.components().count()));
        Ok(Self { accounts })
    }

    fn account_root(account: &AccountConfig, global: &[String]) -> Result<AccountRoot, WatchError> {
        let patterns: Vec<String> = global.iter().chain(&account.exclude).cloned().collect();
        let rules = IgnoreRules::load(&account.name, &account.root, &patterns)?;

        Ok(AccountRoot {
            name: Arc::from(account.name.as_str()),
            root: account.root.clone(),
            layout: account.layout,
            utf7: account.utf7,
            rules,
        })
    }

    /// Account roots, deepest first
    pub fn roots(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.accounts
            .iter()
            .map(|account| (&*account.name, account.root.as_path()))
    }

    pub fn resolve(&self, event: &RawEvent) -> Resolution {
        match self.resolve_path(&event.path, event.kind, event.entry) {
            Ok(key) => Resolution::Resolved(ResolvedEvent::new(key, event.at)),
            Err(reason) => Resolution::Ignored(reason),
        }
    }

    pub fn resolve_path(
        &self,
        path: &Path,
        kind: ChangeKind,
        entry: EntryKind,
    ) -> Result<SyncKey, IgnoreReason> {
        // 1. Longest matching root (strip_prefix compares whole components)
        let (account, relative) = self
            .accounts
            .iter()
            .find_map(|account| {
                path.strip_prefix(&account.root)
                    .ok()
                    .map(|relative| (account, relative))
            })
            .ok_or(IgnoreReason::OutsideRoots)?;

        if kind == ChangeKind::Overflow {
            return Ok(SyncKey::account(account.name.clone()));
        }

        let components = relative
            .components()
            .map(|component| match component {
                Component::Normal(name) => name.to_str().ok_or(IgnoreReason::Undecodable),
                _ => Err(IgnoreReason::NotAFolder),
            })
            .collect::<Result<Vec<&str>, _>>()?;

        let Some((&name, parents)) = components.split_last() else {
            return Err(IgnoreReason::AccountRoot);
        };

        if account.layout == FolderLayout::Dbox {
            let folder = dbox_folder(&components, entry, account.utf7)?;
            return account.key(folder);
        }

        // 2. Strip the maildir leaf
        let folder_components = match parents.split_last() {
            Some((&leaf, folder)) if is_leaf(leaf) => {
                if leaf == TMP {
                    return Err(IgnoreReason::TempArea);
                }
                if is_hidden_entry(name) {
                    return Err(IgnoreReason::TempFile);
                }
                folder
            }
            _ if is_leaf(name) => {
                if name == TMP {
                    return Err(IgnoreReason::TempArea);
                }
                parents
            }
            _ => {
                if is_bookkeeping(name) {
                    return Err(IgnoreReason::Bookkeeping);
                }
                if entry != EntryKind::Dir {
                    return Err(IgnoreReason::NotAFolder);
                }
                &components[..]
            }
        };

        // 3. Map the remaining directories to a logical folder
        let folder = match account.layout {
            FolderLayout::MaildirPlusPlus => dotted_folder(folder_components, account.utf7)?,
            FolderLayout::Fs | FolderLayout::Dbox => nested_folder(folder_components, account.utf7)?,
        };
        account.key(folder)
    }
}

impl AccountRoot {
    fn key(&self, folder: FolderPath) -> Result<SyncKey, IgnoreReason> {
        if self.rules.is_excluded(folder.as_str()) {
            return Err(IgnoreReason::Excluded);
        }
        Ok(SyncKey::folder(self.name.clone(), folder))
    }
}

/// `Mail/mailboxes/Lists/rust/dbox-Mails/u.1` -> `Lists/rust`
///
/// Only message files and the `dbox-Mails` and mailbox directories count.
/// The index files next to `dbox-Mails` change on every sync.
fn dbox_folder(components: &[&str], entry: EntryKind, utf7: bool) -> Result<FolderPath, IgnoreReason> {
    let ["Mail", "mailboxes", mailbox @ ..] = components else {
        return Err(IgnoreReason::NotAFolder);
    };
    let Some((&name, parents)) = mailbox.split_last() else {
        return Err(IgnoreReason::NotAFolder);
    };

    let folder = match parents.split_last() {
        Some((&DBOX_MAILS, folder)) => {
            if is_bookkeeping(name) {
                return Err(IgnoreReason::Bookkeeping);
            }
            if is_hidden_entry(name) {
                return Err(IgnoreReason::TempFile);
            }
            folder
        }
        _ if name == DBOX_MAILS => parents,
        _ => {
            if is_bookkeeping(name) {
                return Err(IgnoreReason::Bookkeeping);
            }
            if entry != EntryKind::Dir {
                return Err(IgnoreReason::NotAFolder);
            }
            mailbox
        }
    };

    if folder.is_empty() || folder.contains(&DBOX_MAILS) {
        return Err(IgnoreReason::NotAFolder);
    }
    nested_folder(folder, utf7)
}

/// `Lists/rust/cur/...` -> `Lists/rust`
fn nested_folder(components: &[&str], utf7: bool) -> Result<FolderPath, IgnoreReason> {
    if components.is_empty() {
        return Ok(FolderPath::inbox());
    }

    let mut segments = Vec::with_capacity(components.len());
    for &component in components {
        if component.starts_with('.') {
            return Err(IgnoreReason::Hidden);
        }
        if is_leaf(component) {
            return Err(IgnoreReason::NotAFolder);
        }
        segments.push(decode(component, utf7)?);
    }
    Ok(FolderPath::from(segments.join("/")))
}

/// `.Lists.rust/cur/...` -> `Lists/rust`
fn dotted_folder(components: &[&str], utf7: bool) -> Result<FolderPath, IgnoreReason> {
    match components {
        [] => Ok(FolderPath::inbox()),
        [dir] => {
            let name = dir.strip_prefix('.').ok_or(IgnoreReason::NotAFolder)?;
            if name.is_empty() || name.split('.').any(str::is_empty) {
                return Err(IgnoreReason::NotAFolder);
            }
            let segments = name
                .split('.')
                .map(|segment| decode(segment, utf7))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FolderPath::from(segments.join("/")))
        }
        _ => Err(IgnoreReason::NotAFolder),
    }
}

/// Decode IMAP modified UTF-7 (RFC 3501 5.1.3)
///
/// Names that are not well-formed modified UTF-7, like `R&D-Plans`, are
/// taken literally. A name that decodes to an empty string, `.`, `..` or
/// anything containing `/` is rejected.
fn decode(segment: &str, utf7: bool) -> Result<String, IgnoreReason> {
    let name = if utf7 && segment.contains('&') && is_modified_utf7(segment) {
        utf7_imap::decode_utf7_imap(segment.to_string())
    } else {
        segment.to_string()
    };

    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(IgnoreReason::Undecodable);
    }
    Ok(name)
}

/// Every `&` opens a run closed by `-`; `&-` is a literal `&`
fn is_modified_utf7(segment: &str) -> bool {
    let mut rest = segment;
    while let Some(start) = rest.find('&') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('-') else {
            return false;
        };
        let run = &after[..end];
        if !run.is_empty() && !is_utf16_run(run) {
            return false;
        }
        rest = &after[end + 1..];
    }
    true
}

/// Modified base64 (`,` for `/`, no padding) of whole UTF-16 code units
fn is_utf16_run(run: &str) -> bool {
    let sextet = |c: u8| match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'a'..=b'z' => Some(c - b'a' + 26),
        b'0'..=b'9' => Some(c - b'0' + 52),
        b'+' => Some(62),
        b',' => Some(63),
        _ => None,
    };
    let Some(values) = run.bytes().map(sextet).collect::<Option<Vec<u8>>>() else {
        return false;
    };
    let Some(&last) = values.last() else {
        return false;
    };

    // Bytes carried by a trailing partial quantum, and the bits of its last
    // character that must stay zero
    let (tail_bytes, unused_bits) = match values.len() % 4 {
        0 => (0, 0),
        2 => (1, 0b1111),
        3 => (2, 0b11),
        _ => return false,
    };
    let bytes = values.len() / 4 * 3 + tail_bytes;
    bytes % 2 == 0 && last & unused_bits == 0
}
