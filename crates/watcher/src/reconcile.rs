//! Startup and periodic refresh
//!
//! Changes made while the daemon was not running, or missed by the watch
//! source, are only caught by a full run of the synchronization command.
//! This scheduler requests those runs:
//! - one account-wide sync per account at startup
//! - optionally, an INBOX sync per account on a fixed cadence
//! - optionally, an account-wide sync per account on a fixed cadence
//!
//! An account-wide run also covers the INBOX, so it restarts the INBOX
//! cadence.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mailwatch_core::{Config, SyncKey, INBOX};

/// Periodic refresh scheduler
pub struct RefreshScheduler {
    /// Account names
    accounts: Vec<Arc<str>>,

    /// Request account-wide syncs right away (default: true)
    sync_on_startup: bool,

    inbox_interval: Option<Duration>,
    account_interval: Option<Duration>,

    /// Sender for sync requests (no quiet period applies)
    request_tx: mpsc::Sender<SyncKey>,
}

impl RefreshScheduler {
    pub fn new(accounts: Vec<Arc<str>>, request_tx: mpsc::Sender<SyncKey>) -> Self {
        Self {
            accounts,
            sync_on_startup: true,
            inbox_interval: None,
            account_interval: None,
            request_tx,
        }
    }

    pub fn from_config(config: &Config, request_tx: mpsc::Sender<SyncKey>) -> Self {
        let accounts = config
            .accounts
            .iter()
            .map(|account| Arc::from(account.name.as_str()))
            .collect();

        Self::new(accounts, request_tx)
            .with_startup_sync(config.daemon.sync_on_startup)
            .with_inbox_interval(config.schedule.inbox_interval_secs.map(Duration::from_secs))
            .with_account_interval(config.schedule.account_interval_secs.map(Duration::from_secs))
    }

    pub fn with_startup_sync(mut self, enabled: bool) -> Self {
        self.sync_on_startup = enabled;
        self
    }

    pub fn with_inbox_interval(mut self, interval: Option<Duration>) -> Self {
        self.inbox_interval = interval;
        self
    }

    pub fn with_account_interval(mut self, interval: Option<Duration>) -> Self {
        self.account_interval = interval;
        self
    }

    /// Whether `run` has anything to do at all
    pub fn is_active(&self) -> bool {
        self.sync_on_startup || self.inbox_interval.is_some() || self.account_interval.is_some()
    }

    /// Run until shutdown or until the request channel closes
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            startup = self.sync_on_startup,
            inbox_interval = ?self.inbox_interval,
            account_interval = ?self.account_interval,
            "Starting refresh scheduler"
        );

        if self.sync_on_startup && !self.request_all(SyncKey::account).await {
            return;
        }

        let start = Instant::now();
        let mut next_inbox = after(start, self.inbox_interval);
        let mut next_account = after(start, self.account_interval);
        let far = start + Duration::from_secs(86_400 * 365);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_until(next_account.unwrap_or(far)), if next_account.is_some() => {
                    debug!("Scheduled account refresh");
                    if !self.request_all(SyncKey::account).await {
                        break;
                    }
                    let now = Instant::now();
                    next_account = after(now, self.account_interval);
                    next_inbox = after(now, self.inbox_interval);
                }
                _ = sleep_until(next_inbox.unwrap_or(far)), if next_inbox.is_some() => {
                    debug!("Scheduled INBOX refresh");
                    if !self.request_all(|account| SyncKey::folder(account, INBOX)).await {
                        break;
                    }
                    next_inbox = after(Instant::now(), self.inbox_interval);
                }
            }
        }

        debug!("Refresh scheduler stopped");
    }

    /// Send one request per account; false once the receiver is gone
    async fn request_all(&self, key: impl Fn(Arc<str>) -> SyncKey) -> bool {
        for account in &self.accounts {
            if self.request_tx.send(key(Arc::clone(account))).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Next slot of a cadence; an interval past the end of time never fires
fn after(at: Instant, interval: Option<Duration>) -> Option<Instant> {
    interval.and_then(|interval| at.checked_add(interval))
}
