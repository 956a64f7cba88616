//! Reconnect delay schedule.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential reconnect delays with an optional attempt limit.
///
/// The first retry after a failure waits `initial`; each further
/// consecutive failure doubles the wait up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    failures: u32,
}

impl Backoff {
    /// Create a schedule.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            failures: 0,
        }
    }

    /// Create a schedule from connection settings.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.initial_backoff(),
            config.max_backoff(),
            config.max_attempts,
        )
    }

    /// Count a failed attempt. Returns `false` once the limit is reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.max_attempts == 0 || self.failures < self.max_attempts
    }

    /// Consecutive failures since the last success.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait before the next attempt.
    #[must_use]
    pub fn delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            max_attempts,
        )
    }

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff = backoff(0);
        assert_eq!(backoff.delay(), Duration::from_millis(500));

        let mut delays = Vec::new();
        for _ in 0..8 {
            assert!(backoff.record_failure());
            delays.push(backoff.delay().as_millis());
        }
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let mut backoff = backoff(0);
        for _ in 0..1_000 {
            assert!(backoff.record_failure());
        }
        assert_eq!(backoff.delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_limit() {
        let mut backoff = backoff(3);
        assert!(backoff.record_failure());
        assert!(backoff.record_failure());
        assert!(!backoff.record_failure());
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn test_reset() {
        let mut backoff = backoff(2);
        assert!(backoff.record_failure());
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.record_failure());
    }

    #[test]
    fn test_from_config() {
        let backoff = Backoff::from_config(&ConnectionConfig::default());
        assert_eq!(backoff.delay(), Duration::from_millis(500));
        assert_eq!(backoff.failures(), 0);
    }
}
