//! Per-delivery processing: cancellation, timing, timeout and transport retry.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;

use super::handler::{HandlerError, HandlerRegistry, TaskHandler};
use crate::broker::Broker;
use crate::error::QueueResult;
use crate::retry::{DeadLetterEntry, RetryConfig};
use crate::stats::{PoolStats, QueueStats};
use crate::task::{Task, TaskEnvelope};

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded.
    Succeeded,
    /// The task was cancelled; the handler did not run.
    Cancelled,
    /// Delivered before its time and pushed back.
    Deferred,
    /// Failed and rescheduled for another attempt.
    Retried,
    /// Failed for good and held as a dead letter.
    DeadLettered,
}

/// Runs deliveries through their handlers and owns transport-level retry.
pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    retry: RetryConfig,
    stats: Arc<PoolStats>,
}

impl TaskDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        retry: RetryConfig,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self {
            broker,
            registry,
            retry,
            stats,
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Process one delivery.
    ///
    /// Only broker failures are returned as errors; handler failures are
    /// turned into a retry or a dead letter.
    pub async fn process(&self, envelope: TaskEnvelope) -> QueueResult<Outcome> {
        let stats = self.stats.queue(envelope.queue());
        let task_id = envelope.id().clone();

        match self.broker.is_cancelled(&task_id).await {
            Ok(true) => {
                tracing::info!(task_id = %task_id, "Skipping cancelled task");
                bump(stats, |s| &s.cancelled);
                return Ok(Outcome::Cancelled);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Cancellation check failed, running task");
            }
        }

        if envelope.deliver_at > Utc::now() {
            tracing::debug!(task_id = %task_id, deliver_at = %envelope.deliver_at, "Early delivery, deferring");
            self.broker.push(envelope).await?;
            bump(stats, |s| &s.deferred);
            return Ok(Outcome::Deferred);
        }

        let task_type = envelope.task.task_type();
        let Some(handler) = self.registry.get(task_type) else {
            tracing::error!(task_id = %task_id, task_type = %task_type, "No handler registered");
            let error = format!("No handler registered for {task_type}");
            self.broker
                .dead_letter(DeadLetterEntry::new(envelope, error))
                .await?;
            bump(stats, |s| &s.dead_lettered);
            return Ok(Outcome::DeadLettered);
        };

        bump(stats, |s| &s.started);
        bump(stats, |s| &s.in_flight);
        let result = run_handler(handler.as_ref(), &envelope.task).await;
        if let Some(stats) = stats {
            stats.finish();
        }

        let err = match result {
            Ok(()) => {
                tracing::info!(task_id = %task_id, task_type = %task_type, attempt = envelope.attempt, "Task succeeded");
                bump(stats, |s| &s.succeeded);
                return Ok(Outcome::Succeeded);
            }
            Err(err) => err,
        };
        bump(stats, |s| &s.failed);

        if err.retryable && RetryConfig::should_retry(envelope.attempt, envelope.task.max_retries) {
            let delay = self.retry.delay_for_attempt(envelope.attempt);
            let deliver_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
            tracing::warn!(
                task_id = %task_id,
                attempt = envelope.attempt,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "Task failed, scheduling retry"
            );
            self.broker.push(envelope.next_attempt(deliver_at)).await?;
            bump(stats, |s| &s.retried);
            return Ok(Outcome::Retried);
        }

        tracing::error!(
            task_id = %task_id,
            attempt = envelope.attempt,
            error = %err,
            "Task failed permanently, moving to dead letter"
        );
        self.broker
            .dead_letter(DeadLetterEntry::new(envelope, err.message))
            .await?;
        bump(stats, |s| &s.dead_lettered);
        Ok(Outcome::DeadLettered)
    }
}

fn bump(stats: Option<&QueueStats>, counter: impl Fn(&QueueStats) -> &std::sync::atomic::AtomicU64) {
    if let Some(stats) = stats {
        QueueStats::incr(counter(stats));
    }
}

/// Run a handler bounded by the task timeout, turning panics into fatal errors.
async fn run_handler(handler: &dyn TaskHandler, task: &Task) -> Result<(), HandlerError> {
    let run = AssertUnwindSafe(handler.handle(task)).catch_unwind();

    match tokio::time::timeout(task.timeout(), run).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(HandlerError::fatal(format!(
            "Handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(HandlerError::retryable(format!(
            "Handler timed out after {}s",
            task.timeout_secs
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::memory::MemoryBroker;
    use crate::task::{TaskOrigin, TaskType, queues};

    struct Flaky {
        failures_left: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err(HandlerError {
                message: "platform busy".to_string(),
                retryable: self.retryable,
            })
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl TaskHandler for Sleeps {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn dispatcher(broker: &MemoryBroker, handler: Arc<dyn TaskHandler>) -> TaskDispatcher {
        TaskDispatcher::new(
            Arc::new(broker.clone()),
            HandlerRegistry::new().register(TaskType::PublishContent, handler),
            RetryConfig::default(),
            Arc::new(PoolStats::new([queues::CRITICAL])),
        )
    }

    fn flaky(failures: u32, retryable: bool) -> Arc<dyn TaskHandler> {
        Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            retryable,
        })
    }

    fn publish_envelope() -> TaskEnvelope {
        TaskEnvelope::new(Task::publish("item1", TaskOrigin::Direct))
    }

    #[tokio::test]
    async fn test_success() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(0, true));

        let outcome = dispatcher.process(publish_envelope()).await.unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        let snapshot = dispatcher.stats().snapshot();
        assert_eq!(snapshot[queues::CRITICAL].succeeded, 1);
        assert_eq!(snapshot[queues::CRITICAL].in_flight, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules_with_backoff() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(1, true));
        let before = Utc::now();

        let outcome = dispatcher.process(publish_envelope()).await.unwrap();

        assert_eq!(outcome, Outcome::Retried);
        let pending = broker.pending(queues::CRITICAL).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt, 1);
        assert!(pending[0].deliver_at >= before + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_fatal_failure_dead_letters_immediately() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(1, false));

        let outcome = dispatcher.process(publish_envelope()).await.unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error, "platform busy");
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(10, true));
        let mut envelope = publish_envelope();
        envelope.attempt = envelope.task.max_retries;

        let outcome = dispatcher.process(envelope).await.unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(broker.dead_letters(10).await.unwrap()[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_skipped() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(10, true));
        let envelope = publish_envelope();
        broker.cancel(envelope.id()).await.unwrap();

        let outcome = dispatcher.process(envelope).await.unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert!(broker.pending(queues::CRITICAL).await.is_empty());
    }

    #[tokio::test]
    async fn test_early_delivery_is_deferred() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(0, true));
        let task = Task::publish("item1", TaskOrigin::Direct)
            .with_not_before(Utc::now() + chrono::Duration::minutes(5));

        let outcome = dispatcher.process(TaskEnvelope::new(task)).await.unwrap();

        assert_eq!(outcome, Outcome::Deferred);
        assert_eq!(broker.pending(queues::CRITICAL).await.len(), 1);
        assert_eq!(dispatcher.stats().snapshot()[queues::CRITICAL].started, 0);
    }

    #[tokio::test]
    async fn test_missing_handler_dead_letters() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, flaky(0, true));
        let envelope = TaskEnvelope::new(Task::expire("item1", TaskOrigin::Direct));

        let outcome = dispatcher.process(envelope).await.unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, Arc::new(Panics));

        let outcome = dispatcher.process(publish_envelope()).await.unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
        let dead = broker.dead_letters(1).await.unwrap();
        assert!(dead[0].last_error.contains("handler bug"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, Arc::new(Sleeps));
        let task =
            Task::publish("item1", TaskOrigin::Direct).with_timeout(Duration::from_secs(5));

        let outcome = dispatcher.process(TaskEnvelope::new(task)).await.unwrap();

        assert_eq!(outcome, Outcome::Retried);
    }
}
