//! Reconnect policy for provider streams

use crate::error::Error;
use std::time::Duration;

/// Exponential backoff applied before any content has streamed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based) after `error`, or `None`
    /// once retries are exhausted or the error is permanent. A `retry-after`
    /// hint replaces the computed backoff.
    pub fn delay(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if attempt >= self.max_retries || !error.is_retryable() {
            return None;
        }
        let delay = match error.retry_after() {
            Some(secs) => Duration::from_secs(secs),
            None => self.base_delay.saturating_mul(1u32 << attempt.min(16)),
        };
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            ..RetryConfig::default()
        };
        let busy = Error::Sse("reset".into());
        assert_eq!(config.delay(0, &busy), Some(Duration::from_secs(1)));
        assert_eq!(config.delay(2, &busy), Some(Duration::from_secs(4)));
        assert_eq!(config.delay(9, &busy), Some(Duration::from_secs(60)));
        assert_eq!(config.delay(10, &busy), None);
    }

    #[test]
    fn test_retry_after_wins() {
        let limited = Error::from_status(429, Some(5), "");
        assert_eq!(RetryConfig::default().delay(0, &limited), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_permanent_errors_and_none_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.delay(0, &Error::from_status(400, None, "")), None);
        assert_eq!(RetryConfig::none().delay(0, &Error::Sse("x".into())), None);
    }
}
