//! Configuration errors
//!
//! All of these are detected while loading the configuration and are fatal
//! before the watcher starts.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not determine the configuration directory")]
    NoConfigDir,

    #[error("no [[account]] configured")]
    NoAccounts,

    #[error("account name must not be empty")]
    EmptyAccountName,

    #[error("account '{0}' is configured twice")]
    DuplicateAccount(String),

    #[error("root of account '{account}' must be absolute: {root}")]
    RelativeRoot { account: String, root: PathBuf },

    #[error("accounts '{first}' and '{second}' share the root {root}")]
    DuplicateRoot {
        first: String,
        second: String,
        root: PathBuf,
    },

    #[error("command.program must not be empty")]
    EmptyProgram,

    #[error("invalid template in {field}: {source}")]
    Template {
        field: &'static str,
        #[source]
        source: TemplateError,
    },

    #[error("command.account_args must not use {{folder}}")]
    FolderInAccountArgs,

    #[error("{key} = {value} is out of range ({range})")]
    OutOfRange {
        key: String,
        value: u64,
        range: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}} (expected {{account}} or {{folder}})")]
    UnknownPlaceholder(String),

    #[error("unclosed placeholder in '{0}'")]
    Unclosed(String),

    #[error("unmatched '}}' in '{0}' (use '}}}}' for a literal brace)")]
    UnmatchedBrace(String),
}
