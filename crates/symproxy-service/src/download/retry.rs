use std::time::Duration;

use crate::config::DownloadConfig;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Bounded retry schedule for one fetch.
///
/// Attempts are numbered from 1. The first attempt starts immediately, attempt `n > 1` starts
/// `factor * 2^(n - 2)` seconds after attempt `n - 1` failed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            factor: if factor.is_finite() { factor.max(0.0) } else { 0.0 },
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.max_retries, config.retry_backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay before the attempt following `attempt`, or `None` once the budget is
    /// exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.factor * 2f64.powi(exponent);
        Some(Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::from_config(&DownloadConfig::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(600)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(100, 10.0);
        assert_eq!(policy.next_delay(50), Some(MAX_BACKOFF));
    }

    #[test]
    fn test_single_attempt() {
        let policy = RetryPolicy::new(0, 0.3);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn test_zero_factor() {
        let policy = RetryPolicy::new(3, 0.0);
        assert_eq!(policy.next_delay(1), Some(Duration::ZERO));
    }
}
