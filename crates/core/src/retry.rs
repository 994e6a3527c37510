use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy stated as data: attempt bound plus exponential backoff base
/// and cap. Consumers (the job runner and the dispatcher) own the sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Backoff before the retry following `failed_attempts` failures:
    /// `base * 2^(failed_attempts - 1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Returns `true` when no further attempt is allowed.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 500, 30_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 450);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(450));
        assert_eq!(policy.delay_for(40), Duration::from_millis(450));
    }

    #[test]
    fn exhaustion_respects_attempt_bound() {
        let policy = RetryPolicy::new(3, 10, 100);
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn at_least_one_attempt_is_always_allowed() {
        let policy = RetryPolicy::new(0, 10, 5);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay_ms, 10);
    }
}
