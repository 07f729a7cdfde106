//! Coalescer: one trigger per burst of events
//!
//! The first event for an idle key creates a pending trigger and a timer
//! task. Further events only move the trigger's deadline; the timer
//! re-reads it after every wake-up and fires once the key has been quiet
//! for the key's quiet period (or the optional burst cap has passed).
//!
//! Events for a key that is already dispatched never start a new burst:
//! while it waits for a permit they are absorbed by the upcoming run, while
//! it runs they set the retrigger flag.

use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use mailwatch_core::{Config, ResolvedEvent, SyncKey};

use crate::dispatcher::{folder_label, Dispatcher};
use crate::state::{KeyState, PendingTrigger, Phase};

/// Quiet period per account
#[derive(Debug, Clone)]
pub struct QuietPeriods {
    default: Duration,
    overrides: HashMap<Arc<str>, Duration>,
}

impl QuietPeriods {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, account: &str, quiet: Duration) -> Self {
        self.overrides.insert(Arc::from(account), quiet);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        config
            .accounts
            .iter()
            .filter(|account| account.quiet_period_ms.is_some())
            .fold(Self::new(config.daemon.quiet_period()), |periods, account| {
                let quiet = account.quiet_period(&config.daemon);
                periods.with_override(&account.name, quiet)
            })
    }

    pub fn for_account(&self, account: &str) -> Duration {
        self.overrides.get(account).copied().unwrap_or(self.default)
    }
}

/// What an event did to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Started a new burst
    Created,
    /// Extended the pending burst
    Extended,
    /// Folded into a dispatch waiting for a permit
    Absorbed,
    /// Set the retrigger flag of a running key
    Retrigger,
    /// Shutting down
    Rejected,
}

struct Inner {
    dispatcher: Dispatcher,
    quiet: QuietPeriods,
    max_burst: Option<Duration>,
    next_timer: AtomicU64,
}

/// Per-key debouncer in front of the dispatcher
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl Coalescer {
    pub fn new(dispatcher: Dispatcher, quiet: QuietPeriods, max_burst: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                quiet,
                max_burst,
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    pub fn submit(&self, event: ResolvedEvent) -> Submission {
        let dispatcher = &self.inner.dispatcher;
        if dispatcher.is_shutting_down() {
            return Submission::Rejected;
        }

        let mut new_timer = None;
        let mut first_retrigger = false;
        let submission = match dispatcher.table().entry(event.key.clone()) {
            Entry::Vacant(vacant) => {
                let timer = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
                vacant.insert(KeyState::pending(PendingTrigger::new(event.at, timer)));
                new_timer = Some(timer);
                Submission::Created
            }
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                match &mut state.phase {
                    Phase::Pending(trigger) => {
                        trigger.extend(event.at);
                        Submission::Extended
                    }
                    Phase::Queued { absorbed } => {
                        *absorbed += 1;
                        Submission::Absorbed
                    }
                    Phase::Running { .. } => {
                        first_retrigger = !state.retrigger;
                        state.retrigger = true;
                        Submission::Retrigger
                    }
                }
            }
        };

        let key = event.key;
        if let Some(timer) = new_timer {
            debug!(account = %key.account, folder = folder_label(&key), "Burst started");
            let coalescer = self.clone();
            dispatcher.spawn(coalescer.quiet_timer(key, timer));
        } else if first_retrigger {
            info!(
                account = %key.account,
                folder = folder_label(&key),
                "Change during sync, will run again when it finishes"
            );
        }
        submission
    }

    async fn quiet_timer(self, key: SyncKey, timer: u64) {
        let quiet = self.inner.quiet.for_account(&key.account);
        let shutdown = self.inner.dispatcher.shutdown_token().clone();

        while let Some(deadline) = self.fire_if_due(&key, timer, quiet) {
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Fire the trigger if its deadline has passed
    ///
    /// Returns the deadline to wait for, or `None` when this timer is done
    /// (fired, or its trigger was consumed by a direct request).
    fn fire_if_due(&self, key: &SyncKey, timer: u64, quiet: Duration) -> Option<Instant> {
        let table = self.inner.dispatcher.table();
        let mut state = table.get_mut(key)?;

        let Phase::Pending(trigger) = &state.phase else {
            return None;
        };
        if trigger.timer != timer {
            return None;
        }

        let deadline = trigger.deadline(quiet, self.inner.max_burst);
        if Instant::now() < deadline {
            return Some(deadline);
        }

        let events = trigger.events;
        let burst_ms = trigger.burst().as_millis() as u64;
        state.phase = Phase::Queued { absorbed: 0 };
        drop(state);

        info!(
            account = %key.account,
            folder = folder_label(key),
            events,
            burst_ms,
            "Trigger fired"
        );
        self.inner.dispatcher.fired(key.clone());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::KeyPhase;
    use crate::testing::{harness, harness_with, RecordingRunner};
    use std::path::Path;
    use tokio::time::sleep;

    const Q: Duration = Duration::from_secs(2);
    const RUN: Duration = Duration::from_millis(100);

    fn event(key: &SyncKey) -> ResolvedEvent {
        ResolvedEvent::now(key.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_change_fires_once_after_quiet_period() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        let t0 = Instant::now();
        let key = SyncKey::folder("a", "INBOX");

        assert_eq!(h.coalescer.submit(event(&key)), Submission::Created);
        assert_eq!(h.dispatcher.snapshot(&key).unwrap().phase, KeyPhase::Pending);

        sleep(Q - Duration::from_millis(1)).await;
        assert!(runner.starts().is_empty());

        sleep(Duration::from_secs(5)).await;
        let runs = runner.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].started, t0 + Q);
        assert_eq!(h.dispatcher.stats().triggers, 1);
        assert_eq!(h.dispatcher.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_within_quiet_period_fire_once() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        let t0 = Instant::now();
        let key = SyncKey::folder("a", "INBOX");

        // t, t + 0.3Q, t + 0.6Q
        assert_eq!(h.coalescer.submit(event(&key)), Submission::Created);
        sleep(Q.mul_f64(0.3)).await;
        assert_eq!(h.coalescer.submit(event(&key)), Submission::Extended);
        sleep(Q.mul_f64(0.3)).await;
        assert_eq!(h.coalescer.submit(event(&key)), Submission::Extended);
        assert_eq!(h.dispatcher.snapshot(&key).unwrap().events, 3);

        sleep(Duration::from_secs(10)).await;

        let starts = runner.starts();
        assert_eq!(starts.len(), 1);
        assert!(starts[0] >= t0 + Q.mul_f64(0.6) + Q);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_five() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        let key = SyncKey::folder("a", "Sent");

        let mut last = Instant::now();
        for i in 0..5 {
            if i > 0 {
                sleep(Duration::from_millis(100)).await;
            }
            last = Instant::now();
            h.coalescer.submit(event(&key));
        }

        sleep(Duration::from_secs(10)).await;

        let starts = runner.starts();
        assert_eq!(starts.len(), 1);
        assert!(starts[0] >= last + Q);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_activity_without_cap_never_fires() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        let key = SyncKey::folder("a", "INBOX");

        for _ in 0..20 {
            h.coalescer.submit(event(&key));
            sleep(Duration::from_millis(500)).await;
        }
        assert!(runner.starts().is_empty());

        sleep(Q + Duration::from_secs(1)).await;
        assert_eq!(runner.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_burst_forces_fire() {
        let runner = RecordingRunner::new(RUN);
        let h = harness_with(runner.clone(), 2, QuietPeriods::new(Q), Some(Duration::from_secs(3)));
        let t0 = Instant::now();
        let key = SyncKey::folder("a", "INBOX");

        for _ in 0..20 {
            h.coalescer.submit(event(&key));
            sleep(Duration::from_millis(500)).await;
        }

        let starts = runner.starts();
        assert!(!starts.is_empty());
        assert_eq!(starts[0], t0 + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        let t0 = Instant::now();
        let busy = SyncKey::folder("a", "Lists/rust");
        let quiet = SyncKey::folder("b", "INBOX");

        h.coalescer.submit(event(&quiet));
        for _ in 0..10 {
            h.coalescer.submit(event(&busy));
            sleep(Duration::from_millis(500)).await;
        }

        let runs = runner.runs_for(&quiet);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].started, t0 + Q);
        assert!(runner.runs_for(&busy).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_quiet_override() {
        let runner = RecordingRunner::new(RUN);
        let periods = QuietPeriods::new(Q).with_override("slow", Duration::from_secs(5));
        let h = harness_with(runner.clone(), 2, periods, None);
        let t0 = Instant::now();
        let fast = SyncKey::folder("fast", "INBOX");
        let slow = SyncKey::folder("slow", "INBOX");

        h.coalescer.submit(event(&fast));
        h.coalescer.submit(event(&slow));
        sleep(Duration::from_secs(10)).await;

        assert_eq!(runner.runs_for(&fast)[0].started, t0 + Q);
        assert_eq!(runner.runs_for(&slow)[0].started, t0 + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_after_shutdown() {
        let runner = RecordingRunner::new(RUN);
        let h = harness(runner.clone(), 2, Q);
        h.shutdown.cancel();

        let key = SyncKey::folder("a", "INBOX");
        assert_eq!(h.coalescer.submit(event(&key)), Submission::Rejected);
        assert_eq!(h.dispatcher.active_keys(), 0);
    }

    #[test]
    fn test_quiet_periods_from_config() {
        let config = Config::parse(
            r#"
            [daemon]
            quiet_period_ms = 1500

            [[account]]
            name = "home"
            root = "/mail/home"

            [[account]]
            name = "work"
            root = "/mail/work"
            quiet_period_ms = 5000
            "#,
            Path::new("test.toml"),
        )
        .unwrap();
        let periods = QuietPeriods::from_config(&config);

        assert_eq!(periods.for_account("home"), Duration::from_millis(1500));
        assert_eq!(periods.for_account("work"), Duration::from_secs(5));
        assert_eq!(periods.for_account("unknown"), Duration::from_millis(1500));
    }
}
