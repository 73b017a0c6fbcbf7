//! Retry policy and backoff computation.

use std::time::Duration;

/// Retry configuration shared by the pool executor and the upload
/// orchestrator.
///
/// The executor runs `max_retries + 1` attempts per job; the orchestrator's
/// upload loop runs `max_retries` attempts and also uses `max_retries` as the
/// ceiling for persisted, batch-level retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before retry `attempt` (1-indexed: the first retry
    /// after the original attempt is `attempt = 1` and uses exponent 0).
    ///
    /// `min(max_backoff, initial_backoff * factor^(attempt - 1))`; attempt 0
    /// maps to no delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_factor.powi(attempt as i32 - 1);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Sum of all backoff delays a fully exhausted job sleeps through.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|a| self.backoff(a)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        // 1, 2, 4, 8, 16, then the cap.
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(7), Duration::from_secs(30));
        // Large exponents saturate at the cap instead of overflowing.
        assert_eq!(policy.backoff(500), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_monotonic_until_cap() {
        let policy = RetryPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.backoff(attempt);
            assert!(delay >= prev, "backoff must be non-decreasing");
            assert!(delay <= policy.max_backoff);
            prev = delay;
        }
    }

    #[test]
    fn test_attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().backoff(0), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[test]
    fn test_total_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        };
        // 10 + 20 + 40
        assert_eq!(policy.total_backoff(), Duration::from_millis(70));
    }
}
