//! Durable task broker.
//!
//! The broker persists task envelopes per named queue and honors their
//! delivery time. The Redis implementation keeps one apalis storage namespace
//! per queue for the tasks themselves, plus plain keys for cancellation
//! tombstones and a capped list of dead letters.

use std::collections::HashMap;
use std::time::Duration;

use apalis::prelude::Storage;
use apalis_redis::RedisStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::{QueueError, QueueResult};
use crate::retry::DeadLetterEntry;
use crate::task::{TaskEnvelope, TaskId};

/// How long a cancellation tombstone outlives the request.
pub const DEFAULT_CANCEL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Durable task storage shared by producers and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist an envelope; it becomes visible no earlier than `deliver_at`.
    async fn push(&self, envelope: TaskEnvelope) -> QueueResult<()>;

    /// Record a cancellation request. Returns `false` if one already existed.
    async fn cancel(&self, id: &TaskId) -> QueueResult<bool>;

    /// Whether a cancellation was requested for the task.
    async fn is_cancelled(&self, id: &TaskId) -> QueueResult<bool>;

    /// Hold an exhausted task for inspection.
    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<()>;

    /// Most recent dead letters, newest first.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>>;

    /// Drop dead letters that failed before `older_than`. Returns how many were removed.
    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> QueueResult<u64>;

    /// Move a dead letter back onto its queue with a fresh attempt counter.
    async fn requeue_dead_letter(&self, id: &TaskId) -> QueueResult<bool>;

    /// Take a one-time claim on `key` for `ttl`. Returns `false` if it is
    /// already held.
    async fn claim(&self, key: &str, ttl: Duration) -> QueueResult<bool>;

    /// Drop a claim taken with [`Broker::claim`].
    async fn release(&self, key: &str) -> QueueResult<()>;
}

/// Redis-backed broker.
///
/// Task envelopes go through apalis-redis so the worker pool can consume them
/// with apalis workers; scheduled pushes use the storage's native delayed set.
#[derive(Clone)]
pub struct RedisBroker {
    storages: HashMap<String, RedisStorage<TaskEnvelope>>,
    conn: ConnectionManager,
    prefix: String,
    dead_letter_capacity: usize,
    cancel_ttl: Duration,
}

impl RedisBroker {
    /// Create a broker serving the given queues.
    pub fn new<I, S>(conn: ConnectionManager, prefix: &str, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let storages = queues
            .into_iter()
            .map(Into::into)
            .map(|queue: String| {
                let config = apalis_redis::Config::default()
                    .set_namespace(&format!("{prefix}:{queue}"));
                let storage = RedisStorage::new_with_config(conn.clone(), config);
                (queue, storage)
            })
            .collect();

        Self {
            storages,
            conn,
            prefix: prefix.to_string(),
            dead_letter_capacity: 10_000,
            cancel_ttl: DEFAULT_CANCEL_TTL,
        }
    }

    /// Cap the dead letter list.
    #[must_use]
    pub const fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Storage backing a queue, for worker registration.
    #[must_use]
    pub fn storage(&self, queue: &str) -> Option<RedisStorage<TaskEnvelope>> {
        self.storages.get(queue).cloned()
    }

    /// Names of the queues this broker serves.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }

    fn cancel_key(&self, id: &TaskId) -> String {
        format!("{}:cancelled:{id}", self.prefix)
    }

    fn claim_key(&self, key: &str) -> String {
        format!("{}:once:{key}", self.prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }

    async fn raw_dead_letters(&self) -> QueueResult<Vec<(String, DeadLetterEntry)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.dead_letter_key(), 0, -1).await?;

        Ok(raw
            .into_iter()
            .filter_map(|json| match serde_json::from_str::<DeadLetterEntry>(&json) {
                Ok(entry) => Some((json, entry)),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, envelope: TaskEnvelope) -> QueueResult<()> {
        let queue = envelope.queue().to_string();
        let mut storage = self
            .storages
            .get(&queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.clone()))?;

        let task_id = envelope.id().clone();
        let deliver_at = envelope.deliver_at;

        if deliver_at > Utc::now() {
            // Round up so the delayed set never releases a task before its time
            let run_at = deliver_at.timestamp() + i64::from(deliver_at.timestamp_subsec_nanos() > 0);
            storage
                .schedule(envelope, run_at)
                .await
                .map_err(|e| QueueError::Broker(format!("Failed to schedule task: {e}")))?;
        } else {
            storage
                .push(envelope)
                .await
                .map_err(|e| QueueError::Broker(format!("Failed to push task: {e}")))?;
        }

        tracing::debug!(task_id = %task_id, queue = %queue, deliver_at = %deliver_at, "Task persisted");
        Ok(())
    }

    async fn cancel(&self, id: &TaskId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(self.cancel_key(id))
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(self.cancel_ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(written.is_some())
    }

    async fn is_cancelled(&self, id: &TaskId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.cancel_key(id)).await?;
        Ok(exists)
    }

    async fn claim(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(self.claim_key(key))
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(written.is_some())
    }

    async fn release(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.claim_key(key)).await?;
        Ok(())
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<()> {
        let json = serde_json::to_string(&entry)?;
        let key = self.dead_letter_key();
        let mut conn = self.conn.clone();

        let capacity = isize::try_from(self.dead_letter_capacity).unwrap_or(isize::MAX);
        redis::pipe()
            .atomic()
            .lpush(&key, json)
            .ignore()
            .ltrim(&key, 0, capacity.saturating_sub(1))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX).saturating_sub(1);
        let raw: Vec<String> = conn.lrange(self.dead_letter_key(), 0, stop).await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(QueueError::from))
            .collect()
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let key = self.dead_letter_key();
        let mut conn = self.conn.clone();
        let mut removed = 0;

        for (json, entry) in self.raw_dead_letters().await? {
            if entry.failed_at < older_than {
                let count: u64 = conn.lrem(&key, 1, json).await?;
                removed += count;
            }
        }

        Ok(removed)
    }

    async fn requeue_dead_letter(&self, id: &TaskId) -> QueueResult<bool> {
        let found = self
            .raw_dead_letters()
            .await?
            .into_iter()
            .find(|(_, entry)| entry.task_id() == id);

        let Some((json, entry)) = found else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let removed: u64 = conn.lrem(self.dead_letter_key(), 1, json).await?;
        if removed == 0 {
            // Another node requeued it first
            return Ok(false);
        }

        self.push(TaskEnvelope::new(entry.envelope.task)).await?;
        Ok(true)
    }
}
