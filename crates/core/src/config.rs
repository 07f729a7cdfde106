//! Configuration model
//!
//! Loaded from `$XDG_CONFIG_HOME/mail/mailwatch.toml` unless a path is given.
//! Everything is validated up front; the watcher never sees an invalid
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::template::CommandTemplate;

/// Upper bound for timeouts and refresh intervals (one week)
const MAX_PERIOD_SECS: u64 = 7 * 86_400;

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub command: CommandConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default, rename = "account")]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Quiet period before a burst of changes fires (default: 2000)
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Force a fire after this long even under continuous activity
    #[serde(default)]
    pub max_burst_ms: Option<u64>,

    /// Synchronization commands running at once, across all accounts (default: 2)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long shutdown waits for running commands (default: 10)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Request one account-wide sync per account at startup (default: true)
    #[serde(default = "default_true")]
    pub sync_on_startup: bool,

    /// Capacity of the event channels (default: 1024)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            max_burst_ms: None,
            max_concurrency: default_max_concurrency(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sync_on_startup: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl DaemonConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn max_burst(&self) -> Option<Duration> {
        self.max_burst_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// Executable, looked up in PATH (default: mbsync)
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments for a folder sync
    #[serde(default = "default_folder_args")]
    pub args: Vec<String>,

    /// Arguments for an account-wide sync
    #[serde(default = "default_account_args")]
    pub account_args: Vec<String>,

    /// Kill commands running longer than this
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_folder_args(),
            account_args: default_account_args(),
            timeout_secs: None,
        }
    }
}

impl CommandConfig {
    pub fn template(&self) -> Result<CommandTemplate, ConfigError> {
        CommandTemplate::new(&self.program, &self.args, &self.account_args)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// First retry delay for a directory that could not be watched (default: 500)
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Upper bound of the retry delay (default: 60000)
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Folders never synchronized, gitignore syntax, for every account
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            exclude: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Sync every account's INBOX on this cadence
    #[serde(default)]
    pub inbox_interval_secs: Option<u64>,

    /// Sync every account completely on this cadence
    #[serde(default)]
    pub account_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset (default: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// How folders are laid out below an account root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderLayout {
    /// One directory per folder, subfolders nested (`Lists/rust/cur`)
    #[default]
    #[serde(rename = "fs")]
    Fs,
    /// Dot-separated folders in the root (`.Lists.rust/cur`)
    #[serde(rename = "maildir++")]
    MaildirPlusPlus,
    /// Dovecot dbox below the account home (`Mail/mailboxes/Lists/rust/dbox-Mails`)
    #[serde(rename = "dbox")]
    Dbox,
}

/// One mail account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub name: String,

    /// Directory holding the account's maildirs, `~` is expanded
    pub root: PathBuf,

    #[serde(default)]
    pub layout: FolderLayout,

    /// Decode folder names from IMAP modified UTF-7 (default: true)
    #[serde(default = "default_true")]
    pub utf7: bool,

    /// Override of daemon.quiet_period_ms
    #[serde(default)]
    pub quiet_period_ms: Option<u64>,

    /// Additional excluded folders for this account
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl AccountConfig {
    pub fn quiet_period(&self, daemon: &DaemonConfig) -> Duration {
        Duration::from_millis(self.quiet_period_ms.unwrap_or(daemon.quiet_period_ms))
    }
}

impl Config {
    /// Read, expand and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Parse, expand and validate configuration text
    ///
    /// `origin` is only used in error messages.
    pub fn parse(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.expand_roots();
        config.validate()?;
        Ok(config)
    }

    /// Replace a leading `~` in account roots with the home directory
    pub fn expand_roots(&mut self) {
        let home = dirs::home_dir();
        for account in &mut self.accounts {
            account.root = expand_home(&account.root, home.as_deref());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        let mut names = HashSet::new();
        let mut roots: HashMap<&Path, &str> = HashMap::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                return Err(ConfigError::EmptyAccountName);
            }
            if !names.insert(account.name.as_str()) {
                return Err(ConfigError::DuplicateAccount(account.name.clone()));
            }
            if !account.root.is_absolute() {
                return Err(ConfigError::RelativeRoot {
                    account: account.name.clone(),
                    root: account.root.clone(),
                });
            }
            if let Some(first) = roots.insert(account.root.as_path(), account.name.as_str()) {
                return Err(ConfigError::DuplicateRoot {
                    first: first.to_string(),
                    second: account.name.clone(),
                    root: account.root.clone(),
                });
            }
            if let Some(ms) = account.quiet_period_ms {
                check_range(&format!("account.{}.quiet_period_ms", account.name), ms, 1, 3_600_000, "1-3600000")?;
            }
        }

        let daemon = &self.daemon;
        check_range("daemon.quiet_period_ms", daemon.quiet_period_ms, 1, 3_600_000, "1-3600000")?;
        if let Some(ms) = daemon.max_burst_ms {
            check_range("daemon.max_burst_ms", ms, 1, 86_400_000, "1-86400000")?;
        }
        check_range("daemon.max_concurrency", daemon.max_concurrency as u64, 1, 1024, "1-1024")?;
        check_range("daemon.channel_capacity", daemon.channel_capacity as u64, 16, 1 << 20, "16-1048576")?;

        let watch = &self.watch;
        check_range("watch.retry_initial_ms", watch.retry_initial_ms, 1, watch.retry_max_ms.max(1), "1-watch.retry_max_ms")?;

        if let Some(secs) = self.command.timeout_secs {
            check_range("command.timeout_secs", secs, 1, MAX_PERIOD_SECS, "1-604800")?;
        }
        if let Some(secs) = self.schedule.inbox_interval_secs {
            check_range("schedule.inbox_interval_secs", secs, 1, MAX_PERIOD_SECS, "1-604800")?;
        }
        if let Some(secs) = self.schedule.account_interval_secs {
            check_range("schedule.account_interval_secs", secs, 1, MAX_PERIOD_SECS, "1-604800")?;
        }

        self.command.template()?;
        Ok(())
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|account| account.name == name)
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64, range: &'static str) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
            range,
        });
    }
    Ok(())
}

fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Default location of the configuration file
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("mail").join("mailwatch.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Write the example configuration to `path` unless it exists
///
/// Returns true if the file was created.
pub fn init_if_missing(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, example_config()).map_err(io_err)?;
    Ok(true)
}

/// Annotated example configuration
pub fn example_config() -> &'static str {
    r#"# mailwatch configuration

[daemon]
quiet_period_ms = 2000        # wait for this much silence before syncing a folder
# max_burst_ms = 30000        # sync at the latest this long after the first change
max_concurrency = 2           # sync commands running at once
shutdown_grace_secs = 10
sync_on_startup = true        # full sync per account when the daemon starts

[command]
program = "mbsync"
args = ["{account}:{folder}"]
account_args = ["{account}"]
# timeout_secs = 600

[watch]
retry_initial_ms = 500
retry_max_ms = 60000
exclude = ["Trash", "Junk"]

[schedule]
# inbox_interval_secs = 300
# account_interval_secs = 3600

[log]
level = "info"
# file = "/home/me/.local/state/mailwatch.log"

[[account]]
name = "personal"
root = "~/Mail/personal"
layout = "fs"                 # or "maildir++", "dbox"

[[account]]
name = "work"
root = "~/Mail/work"
quiet_period_ms = 5000
exclude = ["Archive/**"]
"#
}

fn default_quiet_period_ms() -> u64 {
    2000
}

fn default_max_concurrency() -> usize {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_program() -> String {
    "mbsync".to_string()
}

fn default_folder_args() -> Vec<String> {
    vec!["{account}:{folder}".to_string()]
}

fn default_account_args() -> Vec<String> {
    vec!["{account}".to_string()]
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
