//! Per-key state
//!
//! A key absent from the table is idle. Present keys are in exactly one
//! phase:
//!
//! ```text
//! Pending --quiet timer--> Queued --permit--> Running --done--> (removed)
//!                            ^                   |
//!                            +----retrigger------+
//! ```
//!
//! Every transition happens under the table's entry guard for that key.

use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Burst of events waiting for its quiet period to elapse
#[derive(Debug, Clone)]
pub(crate) struct PendingTrigger {
    pub first_event: Instant,
    pub last_event: Instant,
    pub events: usize,
    /// Identifies the timer task owning this trigger
    pub timer: u64,
}

impl PendingTrigger {
    pub fn new(at: Instant, timer: u64) -> Self {
        Self {
            first_event: at,
            last_event: at,
            events: 1,
            timer,
        }
    }

    /// Another event of the same burst
    pub fn extend(&mut self, at: Instant) {
        self.last_event = self.last_event.max(at);
        self.events += 1;
    }

    /// When the trigger fires: after `quiet` of silence, or `max_burst` after
    /// the first event, whichever comes first
    pub fn deadline(&self, quiet: Duration, max_burst: Option<Duration>) -> Instant {
        let quiet_deadline = self.last_event + quiet;
        match max_burst {
            Some(cap) => quiet_deadline.min(self.first_event + cap),
            None => quiet_deadline,
        }
    }

    pub fn burst(&self) -> Duration {
        self.last_event.saturating_duration_since(self.first_event)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Pending(PendingTrigger),
    /// Fired, waiting for a concurrency permit; events are absorbed
    Queued { absorbed: usize },
    Running { invocation: Uuid },
}

#[derive(Debug, Clone)]
pub(crate) struct KeyState {
    pub phase: Phase,
    /// Events arrived while the command was running
    pub retrigger: bool,
}

impl KeyState {
    pub fn pending(trigger: PendingTrigger) -> Self {
        Self {
            phase: Phase::Pending(trigger),
            retrigger: false,
        }
    }

    pub fn queued() -> Self {
        Self {
            phase: Phase::Queued { absorbed: 0 },
            retrigger: false,
        }
    }

    pub fn snapshot(&self) -> KeySnapshot {
        let (phase, events) = match &self.phase {
            Phase::Pending(trigger) => (KeyPhase::Pending, trigger.events),
            Phase::Queued { absorbed } => (KeyPhase::Queued, *absorbed),
            Phase::Running { .. } => (KeyPhase::Running, 0),
        };
        KeySnapshot {
            phase,
            retrigger: self.retrigger,
            events,
        }
    }
}

/// Public view of a key's phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Pending,
    Queued,
    Running,
}

/// Point-in-time view of a non-idle key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySnapshot {
    pub phase: KeyPhase,
    pub retrigger: bool,
    /// Events in the pending burst, or absorbed while queued
    pub events: usize,
}
