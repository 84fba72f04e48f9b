//! In-call retry with exponential backoff for platform requests.
//!
//! This is the fine-grained layer: it retries a single platform call within
//! one task attempt. Whole-task redelivery is the worker pool's business.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use herald_common::config::RetrySettings;
use tokio_util::sync::CancellationToken;

use crate::error::{ExternalError, PublishError, PublishResult, codes};

/// Backoff and classification settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any wait.
    pub max_delay: Duration,
    /// Growth factor between waits.
    pub backoff_factor: f64,
    /// Platform codes worth retrying.
    pub retryable_codes: HashSet<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_codes: codes::DEFAULT_RETRYABLE.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_settings(settings: &RetrySettings, retryable_codes: &[i64]) -> PublishResult<Self> {
        let policy = Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            retryable_codes: retryable_codes.iter().copied().collect(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Reject settings that would make delays shrink or exceed their cap.
    pub fn validate(&self) -> PublishResult<()> {
        if self.max_delay < self.initial_delay {
            return Err(PublishError::Config(format!(
                "max_delay ({:?}) is shorter than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(PublishError::Config(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Wait before retry number `retry` (1-based): `initial * factor^(retry-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether a platform code is on the allow-list.
    #[must_use]
    pub fn is_retryable(&self, code: i64) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Set the error's `retryable` flag from the allow-list.
    #[must_use]
    pub fn classify(&self, mut err: ExternalError) -> ExternalError {
        err.retryable = self.is_retryable(err.code);
        err
    }
}

/// Runs platform calls under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: Arc<RetryPolicy>,
}

impl RetryEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// The policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` up to `max_retries + 1` times.
    ///
    /// Only [`PublishError::External`] failures are classified and retried;
    /// any other error is returned immediately. Platform failures come back as
    /// [`PublishError::Failed`] carrying the attempt count. Cancelling `cancel`
    /// during a wait returns [`PublishError::Cancelled`].
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> PublishResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PublishResult<T>>,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(PublishError::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(PublishError::External(err)) => self.policy.classify(err),
                Err(other) => return Err(other),
            };

            if !err.retryable || attempt >= max_attempts {
                if err.retryable {
                    tracing::warn!(attempts = attempt, error = %err, "Retries exhausted");
                } else {
                    tracing::debug!(attempts = attempt, error = %err, "Non-retryable platform error");
                }
                return Err(PublishError::Failed {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.delay(attempt);
            tracing::debug!(
                attempt,
                code = err.code,
                delay_ms = delay.as_millis() as u64,
                "Platform call failed, backing off"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(PublishError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = policy();

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_is_monotonic_and_bounded() {
        for factor in [1.0, 1.5, 2.0, 3.0, 10.0] {
            let policy = RetryPolicy {
                backoff_factor: factor,
                ..policy()
            };
            let mut previous = Duration::ZERO;
            for retry in 1..64 {
                let delay = policy.delay(retry);
                assert!(delay >= previous, "factor {factor} retry {retry}");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_validate() {
        assert!(policy().validate().is_ok());

        let inverted = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..policy()
        };
        assert!(matches!(inverted.validate(), Err(PublishError::Config(_))));

        let shrinking = RetryPolicy {
            backoff_factor: 0.5,
            ..policy()
        };
        assert!(shrinking.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let engine = RetryEngine::new(policy());
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = engine
            .execute(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExternalError::new(codes::RATE_EXCEEDED, "slow down").into())
                } else {
                    Ok("draft-123")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "draft-123");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // initial + initial * factor
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let engine = RetryEngine::new(policy());
        let calls = AtomicU32::new(0);

        let result: PublishResult<()> = engine
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::new(40007, "invalid media id").into())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(PublishError::Failed { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert_eq!(source.code, 40007);
                assert!(!source.retryable);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let engine = RetryEngine::new(policy());
        let calls = AtomicU32::new(0);

        let result: PublishResult<()> = engine
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::new(codes::SERVER_BUSY, "busy").into())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(PublishError::Failed { attempts: 4, ref source }) if source.retryable
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let engine = RetryEngine::new(RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..policy()
        });
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: PublishResult<()> = engine
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::new(codes::SERVER_BUSY, "busy").into())
            })
            .await;

        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let engine = RetryEngine::new(policy());

        let result: PublishResult<()> = engine
            .execute(&CancellationToken::new(), || async {
                Err(PublishError::NotFound("item1".to_string()))
            })
            .await;

        assert!(matches!(result, Err(PublishError::NotFound(_))));
    }
}
