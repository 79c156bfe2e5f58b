//! Retry delay policy for failed runs
//!
//! Kept free of timers so the delay curve can be tested on its own; the
//! scheduler decides when to sleep.

use std::time::Duration;

/// Exponential backoff with a ceiling and a bounded number of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// Retries allowed after the first failed attempt of a cycle
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            max_retries,
        }
    }

    /// Delay before retrying after `failed_attempt` (1-based)
    ///
    /// `base * 2^(failed_attempt - 1)`, saturating, capped at `max_delay`.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// `None` once the cycle has used up its retries
    pub fn retry_delay(&self, failed_attempt: u32) -> Option<Duration> {
        (failed_attempt <= self.max_retries).then(|| self.delay_for(failed_attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(300), 3)
    }

    #[test]
    fn test_consecutive_failures_grow_strictly_and_stay_bounded() {
        let policy = policy();
        let delays: Vec<_> = (1..=3).map(|a| policy.retry_delay(a).unwrap()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(6), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_retries_are_exhausted_after_max() {
        let policy = policy();
        assert!(policy.retry_delay(3).is_some());
        assert_eq!(policy.retry_delay(4), None);
    }

    #[test]
    fn test_zero_retries_never_schedules() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 0);
        assert_eq!(policy.retry_delay(1), None);
    }
}
