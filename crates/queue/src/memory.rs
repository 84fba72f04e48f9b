//! In-process broker.
//!
//! Keeps envelopes in memory and hands them out by delivery time. Used by
//! tests and single-process tooling; nothing survives a restart.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::error::{QueueError, QueueResult};
use crate::retry::DeadLetterEntry;
use crate::task::{TaskEnvelope, TaskId};

#[derive(Default)]
struct State {
    queues: BTreeMap<String, Vec<TaskEnvelope>>,
    cancelled: HashSet<TaskId>,
    claims: HashMap<String, DateTime<Utc>>,
    dead_letters: VecDeque<DeadLetterEntry>,
}

/// Broker backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    known_queues: Option<Arc<HashSet<String>>>,
}

impl MemoryBroker {
    /// Broker that accepts any queue name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that rejects queues outside `queues`.
    #[must_use]
    pub fn with_queues<'a>(queues: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            state: Arc::default(),
            known_queues: Some(Arc::new(queues.into_iter().map(str::to_string).collect())),
        }
    }

    /// Remove and return every envelope on `queue` whose delivery time has come.
    pub async fn take_due(&self, queue: &str, now: DateTime<Utc>) -> Vec<TaskEnvelope> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.queues.get_mut(queue) else {
            return Vec::new();
        };

        let (mut due, later): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|env| env.deliver_at <= now);
        *pending = later;

        due.sort_by_key(|env| env.deliver_at);
        due
    }

    /// Every envelope waiting on `queue`, ordered by delivery time.
    pub async fn pending(&self, queue: &str) -> Vec<TaskEnvelope> {
        let state = self.state.lock().await;
        let mut pending = state.queues.get(queue).cloned().unwrap_or_default();
        pending.sort_by_key(|env| env.deliver_at);
        pending
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, envelope: TaskEnvelope) -> QueueResult<()> {
        if let Some(known) = &self.known_queues {
            if !known.contains(envelope.queue()) {
                return Err(QueueError::UnknownQueue(envelope.queue().to_string()));
            }
        }

        let mut state = self.state.lock().await;
        state
            .queues
            .entry(envelope.queue().to_string())
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn cancel(&self, id: &TaskId) -> QueueResult<bool> {
        Ok(self.state.lock().await.cancelled.insert(id.clone()))
    }

    async fn is_cancelled(&self, id: &TaskId) -> QueueResult<bool> {
        Ok(self.state.lock().await.cancelled.contains(id))
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<()> {
        self.state.lock().await.dead_letters.push_front(entry);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|entry| entry.failed_at >= older_than);
        Ok((before - state.dead_letters.len()) as u64)
    }

    async fn requeue_dead_letter(&self, id: &TaskId) -> QueueResult<bool> {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(pos) = state.dead_letters.iter().position(|e| e.task_id() == id) else {
                return Ok(false);
            };
            state.dead_letters.remove(pos)
        };

        match entry {
            Some(entry) => {
                self.push(TaskEnvelope::new(entry.envelope.task)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let now = Utc::now();
        let until = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state.lock().await;
        match state.claims.get(key) {
            Some(held_until) if *held_until > now => Ok(false),
            _ => {
                state.claims.insert(key.to_string(), until);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> QueueResult<()> {
        self.state.lock().await.claims.remove(key);
        Ok(())
    }
}
