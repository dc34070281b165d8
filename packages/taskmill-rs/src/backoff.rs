//! Retry backoff policy.
//!
//! Default shape: exponential with jitter, capped. Each component carries its
//! own policy; the dispatcher consults it when a handler reports a transient
//! failure without an explicit delay.

use std::time::Duration;

/// Exponential backoff with proportional jitter, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,
    /// Hard cap applied after the exponential step.
    pub max_backoff: Duration,
    /// Fraction of the computed delay used as the jitter band (0.0 disables).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(15 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay with no jitter, for tests and explicit schedules.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max_backoff: delay,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry_count + 1`.
    ///
    /// `retry_count` is the row's current counter, so the first failure
    /// (counter 0) waits `base`, the next `base * 2`, and so on.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(31);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff);
        if self.jitter <= 0.0 {
            return raw;
        }
        let band = raw.as_secs_f64() * self.jitter;
        let offset = fastrand::f64() * 2.0 * band - band;
        let jittered = (raw.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_backoff)
    }
}

/// How many attempts a component allows before poisoning a row.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    /// True once the retry counter has consumed the attempt budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count + 1 >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_without_jitter() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        // Large counters must not overflow.
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(10),
            max_backoff: Duration::from_secs(40),
            jitter: 0.5,
        };
        for _ in 0..200 {
            let d = policy.delay_for(1); // raw = 20s, band ±10s
            assert!(d >= Duration::from_secs(9), "below band: {d:?}");
            assert!(d <= Duration::from_secs(31), "above band: {d:?}");
        }
    }

    #[test]
    fn retry_policy_exhaustion() {
        let policy = RetryPolicy { max_attempts: 3 };
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));
        assert!(policy.is_exhausted(10));
    }
}
