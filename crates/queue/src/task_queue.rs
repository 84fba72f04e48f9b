//! Producer API for scheduling tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::broker::Broker;
use crate::error::{QueueError, QueueResult};
use crate::retry::DeadLetterEntry;
use crate::task::{Task, TaskEnvelope, TaskId};

/// Hands tasks to the broker.
///
/// Every call returns once the broker has persisted the task, whether or not
/// any worker is running. Broker failures are returned to the caller as-is;
/// nothing here retries.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
}

impl TaskQueue {
    /// Create a task queue over a broker.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Make the task visible no earlier than `at`.
    pub async fn schedule_at(&self, task: Task, at: DateTime<Utc>) -> QueueResult<TaskId> {
        self.submit(task.with_not_before(at)).await
    }

    /// Make the task visible after `delay`.
    pub async fn schedule_in(&self, task: Task, delay: Duration) -> QueueResult<TaskId> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| QueueError::InvalidConfig(format!("Delay out of range: {e}")))?;
        self.schedule_at(task, Utc::now() + delay).await
    }

    /// Make the task visible immediately.
    pub async fn enqueue(&self, task: Task) -> QueueResult<TaskId> {
        self.schedule_at(task, Utc::now()).await
    }

    /// Like [`TaskQueue::schedule_at`], but only the first call per `key`
    /// schedules anything until `hold` has passed since `at`.
    ///
    /// Returns `None` when the key is already claimed.
    pub async fn schedule_once(
        &self,
        task: Task,
        at: DateTime<Utc>,
        key: &str,
        hold: Duration,
    ) -> QueueResult<Option<TaskId>> {
        let until_due = (at - Utc::now()).to_std().unwrap_or_default();
        if !self.broker.claim(key, until_due + hold).await? {
            tracing::debug!(key = %key, "Already scheduled, skipping");
            return Ok(None);
        }

        match self.schedule_at(task, at).await {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                if let Err(release) = self.broker.release(key).await {
                    tracing::warn!(key = %key, error = %release, "Failed to release claim");
                }
                Err(e)
            }
        }
    }

    /// Ask workers to skip a task.
    ///
    /// Best-effort: a delivery already running is not interrupted. Returns
    /// `false` when the task had already been cancelled.
    pub async fn cancel(&self, id: &TaskId) -> QueueResult<bool> {
        let written = self.broker.cancel(id).await?;
        tracing::info!(task_id = %id, newly_cancelled = written, "Task cancellation recorded");
        Ok(written)
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.broker.dead_letters(limit).await
    }

    /// Put a dead-lettered task back on its queue.
    pub async fn requeue_dead_letter(&self, id: &TaskId) -> QueueResult<bool> {
        let requeued = self.broker.requeue_dead_letter(id).await?;
        if requeued {
            tracing::info!(task_id = %id, "Dead letter requeued");
        }
        Ok(requeued)
    }

    /// Drop dead letters that failed before `older_than`.
    pub async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        self.broker.purge_dead_letters(older_than).await
    }

    async fn submit(&self, task: Task) -> QueueResult<TaskId> {
        let id = task.id.clone();
        let task_type = task.task_type();
        let queue = task.queue.clone();
        let not_before = task.not_before;

        self.broker.push(TaskEnvelope::new(task)).await?;

        tracing::debug!(
            task_id = %id,
            task_type = %task_type,
            queue = %queue,
            not_before = %not_before,
            "Task scheduled"
        );
        Ok(id)
    }
}
