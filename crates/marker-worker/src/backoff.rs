//! Retry backoff for engine initialization.

use std::time::Duration;

use tokio::time::Instant;

/// Backoff schedule configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Failure count cap
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_failures: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures (1s, 2s, 4s, ... capped).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Failure tracking for a retried operation.
#[derive(Debug)]
pub struct InitBackoff {
    policy: BackoffPolicy,
    failure_count: u32,
    retry_not_before: Option<Instant>,
}

impl InitBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failure_count: 0,
            retry_not_before: None,
        }
    }

    /// Whether an attempt at `now` falls inside the backoff window.
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.retry_not_before.is_some_and(|deadline| now < deadline)
    }

    /// Record a failed attempt at `now`. Returns the delay before the next
    /// attempt is allowed.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failure_count = (self.failure_count + 1).min(self.policy.max_failures);
        let delay = self.policy.delay_for(self.failure_count);
        self.retry_not_before = Some(now + delay);
        delay
    }

    /// Clear the failure history after a success.
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.retry_not_before = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn retry_not_before(&self) -> Option<Instant> {
        self.retry_not_before
    }
}

impl Default for InitBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
