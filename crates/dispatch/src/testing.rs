//! In-memory runner and wiring for scheduling tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use mailwatch_core::{CommandTemplate, SyncKey};

use crate::debounce::{Coalescer, QuietPeriods};
use crate::dispatcher::Dispatcher;
use crate::runner::{CommandRunner, Completion, Invocation, Outcome};

#[derive(Debug, Clone)]
pub(crate) struct Run {
    pub key: SyncKey,
    pub started: Instant,
    pub finished: Instant,
    pub outcome: Outcome,
}

/// Runner that sleeps instead of spawning and records every run
///
/// Panics if a key is ever run twice at the same time, or if a folder of an
/// account runs alongside that account's account-wide sync.
pub(crate) struct RecordingRunner {
    duration: Duration,
    failing: Mutex<HashSet<SyncKey>>,
    running: Mutex<HashSet<SyncKey>>,
    starts: Mutex<Vec<Instant>>,
    runs: Mutex<Vec<Run>>,
    max_active: Mutex<usize>,
    max_per_account: Mutex<HashMap<Arc<str>, usize>>,
}

impl RecordingRunner {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            failing: Mutex::new(HashSet::new()),
            running: Mutex::new(HashSet::new()),
            starts: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            max_active: Mutex::new(0),
            max_per_account: Mutex::new(HashMap::new()),
        })
    }

    /// Make every run of `key` exit nonzero
    pub fn fail(&self, key: &SyncKey) {
        self.failing.lock().insert(key.clone());
    }

    /// Finished runs, in completion order
    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().clone()
    }

    pub fn runs_for(&self, key: &SyncKey) -> Vec<Run> {
        self.runs().into_iter().filter(|run| &run.key == key).collect()
    }

    /// Start times of all runs, finished or not
    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().clone()
    }

    pub fn max_active(&self) -> usize {
        *self.max_active.lock()
    }

    /// Most runs of one account's keys seen at the same time
    pub fn max_active_for(&self, account: &str) -> usize {
        self.max_per_account.lock().get(account).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Completion {
        let key = invocation.key.clone();
        let started = Instant::now();
        {
            let mut running = self.running.lock();
            assert!(running.insert(key.clone()), "two runs of {} at once", key);
            let same_account = running.iter().filter(|other| other.account == key.account).count();
            let mut per_account = self.max_per_account.lock();
            let max = per_account.entry(Arc::clone(&key.account)).or_insert(0);
            *max = (*max).max(same_account);
            drop(per_account);
            let overlapping = running.iter().find(|other| {
                *other != &key
                    && other.account == key.account
                    && (other.is_account_wide() || key.is_account_wide())
            });
            assert!(overlapping.is_none(), "{} runs alongside {:?}", key, overlapping);
            let mut max_active = self.max_active.lock();
            *max_active = (*max_active).max(running.len());
        }
        self.starts.lock().push(started);

        let outcome = tokio::select! {
            _ = sleep(self.duration) => {
                if self.failing.lock().contains(&key) {
                    Outcome::Failed { code: Some(1), signal: None }
                } else {
                    Outcome::Succeeded
                }
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        self.running.lock().remove(&key);
        let finished = Instant::now();
        self.runs.lock().push(Run {
            key,
            started,
            finished,
            outcome: outcome.clone(),
        });
        Completion::new(outcome, finished - started)
    }
}

pub(crate) struct Harness {
    pub coalescer: Coalescer,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

pub(crate) fn template() -> CommandTemplate {
    CommandTemplate::new(
        "mbsync",
        &["{account}:{folder}".to_string()],
        &["{account}".to_string()],
    )
    .expect("valid template")
}

pub(crate) fn harness(runner: Arc<RecordingRunner>, max_concurrency: usize, quiet: Duration) -> Harness {
    harness_with(runner, max_concurrency, QuietPeriods::new(quiet), None)
}

pub(crate) fn harness_with(
    runner: Arc<RecordingRunner>,
    max_concurrency: usize,
    quiet: QuietPeriods,
    max_burst: Option<Duration>,
) -> Harness {
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let dispatcher = Dispatcher::new(
        template(),
        max_concurrency,
        runner,
        shutdown.clone(),
        tracker.clone(),
    );
    let coalescer = Coalescer::new(dispatcher.clone(), quiet, max_burst);

    Harness {
        coalescer,
        dispatcher,
        shutdown,
        tracker,
    }
}
