//! Dispatcher: runs the command for a key, serialized per key
//!
//! A dispatch task owns a key from Queued until the key goes idle again:
//! 1. Wait for a permit from the global limiter (FIFO, so arrival order)
//! 2. Queued -> Running, clear the retrigger flag, run the command
//! 3. Release the permit; if the retrigger flag was set meanwhile, go back
//!    to Queued and repeat, otherwise remove the key
//!
//! Only the dispatch task moves a key out of Queued or Running, which is
//! what keeps a key to one invocation at a time.
//!
//! An account-wide key covers every folder of its account. A folder key
//! whose account-wide key is queued or running is folded into it instead of
//! running, and each account has a gate: folder runs hold one share, the
//! account-wide run holds all of them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use mailwatch_core::{CommandTemplate, SyncKey};

use crate::runner::{CommandRunner, Completion, Invocation, Outcome};
use crate::state::{KeySnapshot, KeyState, Phase};

/// Result of a direct sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// A dispatch was queued (a pending burst, if any, was folded into it)
    Queued,
    /// A dispatch for the key is already waiting for a permit
    Absorbed,
    /// The key is running; it will run once more afterwards
    Retrigger,
    /// Shutting down
    Rejected,
}

#[derive(Debug, Default)]
struct Counters {
    triggers: AtomicU64,
    requests: AtomicU64,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retriggered: AtomicU64,
}

/// Dispatch counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Bursts that fired after their quiet period
    pub triggers: u64,
    /// Direct requests (startup, schedule, overflow, manual)
    pub requests: u64,
    pub started: u64,
    pub succeeded: u64,
    /// Nonzero exits, launch failures and timeouts
    pub failed: u64,
    /// Follow-up runs caused by changes during a run
    pub retriggered: u64,
}

/// Shares of an account gate; more than any number of concurrent folder runs
const ACCOUNT_SHARES: u32 = 1 << 16;

struct Inner {
    table: DashMap<SyncKey, KeyState>,
    gates: DashMap<Arc<str>, Arc<Semaphore>>,
    limiter: Arc<Semaphore>,
    template: CommandTemplate,
    runner: Arc<dyn CommandRunner>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    counters: Counters,
}

/// Per-key serialized command dispatch
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        template: CommandTemplate,
        max_concurrency: usize,
        runner: Arc<dyn CommandRunner>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: DashMap::new(),
                gates: DashMap::new(),
                limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
                template,
                runner,
                shutdown,
                tracker,
                counters: Counters::default(),
            }),
        }
    }

    /// Request a run for `key` right away, without a quiet period
    pub fn request(&self, key: SyncKey) -> Request {
        if self.is_shutting_down() {
            return Request::Rejected;
        }
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let request = match self.inner.table.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(KeyState::queued());
                Request::Queued
            }
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                match &mut state.phase {
                    Phase::Pending(trigger) => {
                        // The run covers the burst; its timer finds the key queued and stops
                        let absorbed = trigger.events;
                        state.phase = Phase::Queued { absorbed };
                        Request::Queued
                    }
                    Phase::Queued { absorbed } => {
                        *absorbed += 1;
                        Request::Absorbed
                    }
                    Phase::Running { .. } => {
                        state.retrigger = true;
                        Request::Retrigger
                    }
                }
            }
        };

        debug!(key = %key, ?request, "Sync requested");
        if request == Request::Queued {
            self.start(key);
        }
        request
    }

    /// Current state of a key, `None` when idle
    pub fn snapshot(&self, key: &SyncKey) -> Option<KeySnapshot> {
        self.inner.table.get(key).map(|state| state.snapshot())
    }

    /// Keys that are not idle
    pub fn active_keys(&self) -> usize {
        self.inner.table.len()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            triggers: c.triggers.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retriggered: c.retriggered.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub(crate) fn table(&self) -> &DashMap<SyncKey, KeyState> {
        &self.inner.table
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(task);
    }

    /// Hand a fired burst to the dispatcher; the key must already be Queued
    pub(crate) fn fired(&self, key: SyncKey) {
        self.inner.counters.triggers.fetch_add(1, Ordering::Relaxed);
        self.start(key);
    }

    fn start(&self, key: SyncKey) {
        let dispatcher = self.clone();
        self.spawn(dispatcher.dispatch(key));
    }

    async fn dispatch(self, key: SyncKey) {
        loop {
            if self.fold_into_account(&key) {
                return;
            }

            // 1. Wait for a permit, then for the account gate
            let permit = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => None,
                permit = Arc::clone(&self.inner.limiter).acquire_owned() => permit.ok(),
            };
            let gate = match permit {
                Some(permit) if !self.is_shutting_down() => tokio::select! {
                    biased;
                    _ = self.inner.shutdown.cancelled() => None,
                    gate = self.enter_gate(&key) => gate.map(|gate| (permit, gate)),
                },
                _ => None,
            };
            let Some((permit, gate)) = gate.filter(|_| !self.is_shutting_down()) else {
                self.inner.table.remove(&key);
                debug!(key = %key, "Dropped queued sync on shutdown");
                return;
            };
            if self.fold_into_account(&key) {
                return;
            }

            // 2. Queued -> Running
            let invocation = Invocation::new(key.clone(), self.inner.template.render(&key));
            let absorbed = match self.inner.table.get_mut(&key) {
                Some(mut state) => {
                    let absorbed = match state.phase {
                        Phase::Queued { absorbed } => absorbed,
                        _ => {
                            debug_assert!(false, "dispatch for {} while {:?}", key, state.phase);
                            return;
                        }
                    };
                    state.phase = Phase::Running {
                        invocation: invocation.id,
                    };
                    state.retrigger = false;
                    absorbed
                }
                None => {
                    debug_assert!(false, "dispatch for {} without state", key);
                    return;
                }
            };

            self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
            info!(
                invocation = %invocation.id,
                account = %key.account,
                folder = folder_label(&key),
                absorbed,
                command = %invocation.command,
                "Sync started"
            );

            let completion = self
                .inner
                .runner
                .run(&invocation, self.inner.shutdown.clone())
                .await;
            drop(gate);
            drop(permit);
            self.report(&invocation, &completion);

            // 3. Running -> Queued again, or idle
            let rerun = match self.inner.table.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let state = occupied.get_mut();
                    debug_assert!(
                        matches!(state.phase, Phase::Running { invocation: id } if id == invocation.id),
                        "state of {} changed during its run",
                        key
                    );
                    if state.retrigger && !self.is_shutting_down() {
                        state.retrigger = false;
                        state.phase = Phase::Queued { absorbed: 0 };
                        true
                    } else {
                        occupied.remove();
                        false
                    }
                }
                Entry::Vacant(_) => false,
            };

            if !rerun {
                return;
            }
            self.inner.counters.retriggered.fetch_add(1, Ordering::Relaxed);
            info!(
                account = %key.account,
                folder = folder_label(&key),
                "Changes arrived during sync, running again"
            );
        }
    }

    /// Hand a folder key over to its account-wide key when that one is
    /// queued or running. Returns true if the folder key was dropped.
    fn fold_into_account(&self, key: &SyncKey) -> bool {
        if key.is_account_wide() {
            return false;
        }
        let account = SyncKey::account(Arc::clone(&key.account));
        let folded = match self.inner.table.get_mut(&account) {
            Some(mut guard) => {
                let state = &mut *guard;
                match &mut state.phase {
                    Phase::Queued { absorbed } => {
                        *absorbed += 1;
                        true
                    }
                    Phase::Running { .. } => {
                        state.retrigger = true;
                        true
                    }
                    Phase::Pending(_) => false,
                }
            }
            None => false,
        };

        if folded {
            self.inner.table.remove(key);
            debug!(
                account = %key.account,
                folder = folder_label(key),
                "Folded into account-wide sync"
            );
        }
        folded
    }

    /// One share of the account gate for a folder key, all shares for the
    /// account-wide key
    async fn enter_gate(&self, key: &SyncKey) -> Option<OwnedSemaphorePermit> {
        let gate = Arc::clone(
            self.inner
                .gates
                .entry(Arc::clone(&key.account))
                .or_insert_with(|| Arc::new(Semaphore::new(ACCOUNT_SHARES as usize)))
                .value(),
        );
        let shares = if key.is_account_wide() { ACCOUNT_SHARES } else { 1 };
        gate.acquire_many_owned(shares).await.ok()
    }

    fn report(&self, invocation: &Invocation, completion: &Completion) {
        let key = &invocation.key;
        let duration_ms = completion.duration.as_millis() as u64;

        match &completion.outcome {
            Outcome::Succeeded => {
                self.inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    invocation = %invocation.id,
                    account = %key.account,
                    folder = folder_label(key),
                    exit = 0,
                    duration_ms,
                    "Sync finished"
                );
                if !completion.stdout.is_empty() {
                    debug!(invocation = %invocation.id, "stdout: {}", completion.stdout);
                }
            }
            Outcome::Cancelled => {
                info!(
                    invocation = %invocation.id,
                    account = %key.account,
                    folder = folder_label(key),
                    duration_ms,
                    "Sync terminated by shutdown"
                );
            }
            failure => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    invocation = %invocation.id,
                    account = %key.account,
                    folder = folder_label(key),
                    exit = %failure,
                    duration_ms,
                    command = %invocation.command,
                    stdout = %completion.stdout,
                    stderr = %completion.stderr,
                    "Sync failed"
                );
            }
        }
    }
}

pub(crate) fn folder_label(key: &SyncKey) -> &str {
    key.folder_path().map(|folder| folder.as_str()).unwrap_or("*")
}
