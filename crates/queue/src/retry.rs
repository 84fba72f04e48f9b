//! Transport-level retry configuration and dead letter entries.
//!
//! This is the per-task redelivery policy owned by the worker pool. It is
//! independent of the finer-grained in-call backoff used for platform requests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskEnvelope, TaskId};

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate the redelivery delay after the given failed attempt (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Check if a task that failed on `attempt` may be redelivered.
    #[must_use]
    pub const fn should_retry(attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries
    }
}

/// Dead letter queue entry for a task that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The failed delivery.
    pub envelope: TaskEnvelope,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Create a new dead letter entry.
    #[must_use]
    pub fn new(envelope: TaskEnvelope, error: String) -> Self {
        Self {
            attempts: envelope.attempt + 1,
            envelope,
            last_error: error,
            failed_at: Utc::now(),
        }
    }

    /// ID of the dead task.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        self.envelope.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskOrigin};

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();

        // First retry: 30s
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(30));
        // Second retry: 60s
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(60));
        // Third retry: 120s
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(120));
    }

    #[test]
    fn test_max_delay() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(7200),
            multiplier: 2.0,
        };

        // Should be capped at max_delay
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(7200));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(7200));
    }

    #[test]
    fn test_should_retry() {
        assert!(RetryConfig::should_retry(0, 3));
        assert!(RetryConfig::should_retry(2, 3));
        assert!(!RetryConfig::should_retry(3, 3));
        assert!(!RetryConfig::should_retry(0, 0));
    }

    #[test]
    fn test_dead_letter_counts_attempts() {
        let envelope = TaskEnvelope::new(Task::publish("item1", TaskOrigin::Direct));
        let last = envelope.next_attempt(Utc::now()).next_attempt(Utc::now());
        let entry = DeadLetterEntry::new(last, "boom".to_string());

        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.task_id(), envelope.id());
    }
}
