//! Backoff between attempts to hand one event to a notification channel.
//!
//! The publisher sends an event up to `max_attempts` times in a row. After
//! that the event stays undelivered in the store and the next redelivery
//! sweep starts over with a fresh budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often, and how patiently, one event is re-sent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Sends per event before it is left to the redelivery sweep
    pub max_attempts: u32,

    /// Wait after the first failed send, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any single wait, in milliseconds
    pub max_delay_ms: u64,

    /// Growth of the wait after each further failed send
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Send once; a failure goes straight to the redelivery sweep
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before the next send, after `failed` consecutive failed sends
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Whether an event already sent `sent` times may be sent again
    pub fn allows_another(&self, sent: u32) -> bool {
        sent < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(8), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_initial_delay_respects_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
    }

    #[test]
    fn test_send_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(4));
        assert!(!policy.allows_another(5));
        assert!(!RetryPolicy::no_retry().allows_another(1));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 2").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_delay_ms, 500);
    }
}
