//! Exponential backoff shared by the persistence writer and client reconnects.

use std::time::Duration;

/// Exponential backoff: `initial`, `initial * multiplier`, ... capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Attempts after the first before giving up (`None` = retry forever).
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        // 1s, 2s, 4s, 8s, 16s, then 30s
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(5),
        }
    }
}

impl BackoffPolicy {
    /// Millisecond delays so tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(40),
            multiplier: 2.0,
            max_retries: Some(3),
        }
    }

    /// Retry forever with the same delays.
    pub fn unbounded(self) -> Self {
        Self {
            max_retries: None,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Whether retry number `attempt` (0-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }
}
