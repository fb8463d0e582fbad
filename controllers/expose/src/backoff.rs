//! # Retry Backoff
//!
//! Provides the backoff policy used when a reconcile fails and its key is
//! requeued. The policy is a pluggable strategy (retry count -> delay) so
//! the retry queue can be driven deterministically in tests.
//!
//! The default policy is exponential: 5ms, 10ms, 20ms, ... doubling per
//! retry and capped at 1000s, matching the per-item curve of client-go's
//! default workqueue rate limiter.

use std::time::Duration;

/// Strategy mapping a key's consecutive failure count to a requeue delay.
///
/// Implementations must be cheap and stateless per call; the retry queue
/// tracks the per-key count itself.
pub trait Backoff: Send + Sync {
    /// Delay before the `retries`-th re-add of a key (1-indexed: the first
    /// failure passes `retries == 1`).
    fn delay_for(&self, retries: u32) -> Duration;
}

/// Exponential backoff with a maximum cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay for the first retry
    base: Duration,
    /// Upper bound on any single delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create an exponential backoff starting at `base` and doubling per
    /// retry up to `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    /// The client-go default item rate limiter curve: 5ms base, 1000s cap.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl Backoff for ExponentialBackoff {
    fn delay_for(&self, retries: u32) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }
        // base * 2^(retries-1), saturating so large counts stay at the cap
        let exp = retries.saturating_sub(1).min(63);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.max);
        delay.min(self.max)
    }
}

/// Fixed delay for every retry. Used by tests to make requeue timing
/// deterministic.
#[derive(Debug, Clone)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay_for(&self, _retries: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::default();

        // Default curve: 5ms, 10ms, 20ms, 40ms, 80ms, ...
        assert_eq!(backoff.delay_for(1), Duration::from_millis(5));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(80));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let backoff = ExponentialBackoff::default();

        // 5ms * 2^29 > 1000s, so deep retry counts pin at the cap
        assert_eq!(backoff.delay_for(30), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(100), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[test]
    fn test_exponential_backoff_monotonic() {
        let backoff = ExponentialBackoff::default();

        // Consecutive failures never shrink the delay
        let mut previous = Duration::ZERO;
        for retries in 1..=64 {
            let delay = backoff.delay_for(retries);
            assert!(delay >= previous, "delay shrank at retry {retries}");
            previous = delay;
        }
    }

    #[test]
    fn test_fixed_backoff_ignores_count() {
        let backoff = FixedBackoff(Duration::from_millis(7));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(7));
        assert_eq!(backoff.delay_for(50), Duration::from_millis(7));
    }
}
