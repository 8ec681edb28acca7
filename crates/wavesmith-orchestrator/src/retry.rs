use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between attempts of a failed task.
///
/// The retry budget itself lives on each task (`max_retries`); this only
/// decides how long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// No waiting at all.
    pub fn none() -> Self {
        Self {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, attempt))
    }
}

/// `base * 2^attempt`, capped at `backoff_max_ms`.
fn compute_backoff(policy: &BackoffPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = BackoffPolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_matches_config_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.backoff_base_ms, 500);
        assert_eq!(policy.backoff_max_ms, 30_000);
        assert_eq!(BackoffPolicy::none().delay(5), Duration::ZERO);
    }
}
