//! Per-object exponential backoff for reconcile errors
//!
//! `kube::runtime::Controller` leaves requeue timing to the error policy.
//! This tracks consecutive failures per object key so the policy can back
//! off exponentially, and resets once a reconcile succeeds.

use std::time::Duration;

use dashmap::DashMap;

const DEFAULT_BASE: Duration = Duration::from_secs(5);
const DEFAULT_MAX: Duration = Duration::from_secs(300);

/// Consecutive-failure tracker keyed by `namespace/name`
#[derive(Debug)]
pub struct ErrorBackoff {
    failures: DashMap<String, u32>,
    base: Duration,
    max: Duration,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl ErrorBackoff {
    /// Create a tracker doubling from `base` up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(16);
        *count = count.saturating_add(1);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Forget failures after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of consecutive failures recorded for a key
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure() {
        let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(2));
        assert_eq!(backoff.next_delay("ns/a"), Duration::from_secs(4));
        assert_eq!(backoff.failures("ns/a"), 3);
    }

    #[test]
    fn delay_is_capped() {
        let backoff = ErrorBackoff::new(Duration::from_secs(10), Duration::from_secs(30));
        for _ in 0..5 {
            backoff.next_delay("k");
        }
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(30));
    }

    #[test]
    fn keys_are_independent_and_reset() {
        let backoff = ErrorBackoff::default();
        backoff.next_delay("a");
        backoff.next_delay("a");
        assert_eq!(backoff.next_delay("b"), DEFAULT_BASE);
        backoff.reset("a");
        assert_eq!(backoff.failures("a"), 0);
        assert_eq!(backoff.next_delay("a"), DEFAULT_BASE);
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let backoff = ErrorBackoff::default();
        for _ in 0..100 {
            backoff.next_delay("k");
        }
        assert_eq!(backoff.next_delay("k"), DEFAULT_MAX);
    }
}
