//! Capped exponential backoff for watch registration retries

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use mailwatch_core::config::WatchConfig;

/// Retry delays: `initial * 2^attempt`, never above `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl From<&WatchConfig> for BackoffPolicy {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.retry_initial_ms.max(1)),
            max: Duration::from_millis(cfg.retry_max_ms.max(cfg.retry_initial_ms).max(1)),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay with up to 10% random jitter, still capped at `max`
    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 10;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        (delay + Duration::from_millis(jitter)).min(self.max)
    }
}

/// Retry state of one path
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    next_attempt: Instant,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            next_attempt: Instant::now() + policy.jittered(0),
        }
    }

    /// Record a failed retry and push the next attempt out
    pub fn failed(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt = Instant::now() + self.policy.jittered(self.attempts);
    }

    pub fn next_attempt(&self) -> Instant {
        self.next_attempt
    }

    /// Failed retries so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(500), Duration::from_secs(1));
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = WatchConfig {
            retry_initial_ms: 250,
            retry_max_ms: 4000,
            exclude: vec![],
        };
        let policy = BackoffPolicy::from(&cfg);

        assert_eq!(policy.initial, Duration::from_millis(250));
        assert_eq!(policy.max, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pushes_next_attempt_out() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        };
        let start = Instant::now();
        let mut backoff = Backoff::new(policy);

        assert!(backoff.next_attempt() >= start + Duration::from_millis(100));
        assert!(backoff.next_attempt() <= start + Duration::from_millis(110));
        assert!(!backoff.is_due(start));

        backoff.failed();
        backoff.failed();

        assert_eq!(backoff.attempts(), 2);
        assert!(backoff.next_attempt() >= start + Duration::from_millis(400));
        assert!(backoff.next_attempt() <= start + Duration::from_millis(440));
    }
}
