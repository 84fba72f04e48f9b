//! Task definitions.
//!
//! A [`Task`] is an immutable unit of work: an ID, a typed payload, the named
//! queue it runs on, its retry budget, its per-attempt timeout and the
//! earliest time it may run. The broker carries it inside a [`TaskEnvelope`],
//! which adds delivery bookkeeping (attempt number, next delivery time).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_common::IdGenerator;
use serde::{Deserialize, Serialize};

/// Named queues and their intended use.
pub mod queues {
    /// Directly requested publishing and credential work.
    pub const CRITICAL: &str = "critical";
    /// Scan-driven publishing.
    pub const DOMAIN_HIGH: &str = "domain-high";
    /// Scan-driven expiry.
    pub const DOMAIN_LOW: &str = "domain-low";
    /// Reporting work.
    pub const ANALYTICS: &str = "analytics";
    /// Everything else.
    pub const DEFAULT: &str = "default";
}

/// Default number of transport retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt handler timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(IdGenerator::new().generate())
    }

    /// Borrow the raw string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Who asked for a task.
///
/// Scan-originated tasks tolerate "nothing to do" outcomes because
/// overlapping scans may emit the same work twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Emitted by a periodic scan.
    Scan,
    /// Requested directly by an API caller.
    Direct,
}

/// Routing tag derived from a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    /// Publish a content item to the external platform.
    PublishContent,
    /// Mark a content item as expired.
    ExpireContent,
    /// Force a fresh platform credential.
    RefreshCredential,
}

impl TaskType {
    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PublishContent => "content.publish",
            Self::ExpireContent => "content.expire",
            Self::RefreshCredential => "credential.refresh",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Publish a content item.
    PublishContent {
        /// Content item ID.
        item_id: String,
        /// Who asked for it.
        origin: TaskOrigin,
    },
    /// Expire a content item.
    ExpireContent {
        /// Content item ID.
        item_id: String,
        /// Who asked for it.
        origin: TaskOrigin,
    },
    /// Invalidate and re-issue the platform credential.
    RefreshCredential,
}

impl TaskPayload {
    /// Routing tag for this payload.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::PublishContent { .. } => TaskType::PublishContent,
            Self::ExpireContent { .. } => TaskType::ExpireContent,
            Self::RefreshCredential => TaskType::RefreshCredential,
        }
    }

    /// Queue a payload runs on unless overridden.
    #[must_use]
    pub const fn default_queue(&self) -> &'static str {
        match self {
            Self::PublishContent {
                origin: TaskOrigin::Direct,
                ..
            }
            | Self::RefreshCredential => queues::CRITICAL,
            Self::PublishContent {
                origin: TaskOrigin::Scan,
                ..
            } => queues::DOMAIN_HIGH,
            Self::ExpireContent { .. } => queues::DOMAIN_LOW,
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: TaskId,
    /// Typed payload.
    pub payload: TaskPayload,
    /// Named queue.
    pub queue: String,
    /// Transport retries allowed after the first attempt.
    pub max_retries: u32,
    /// Per-attempt handler timeout in seconds.
    pub timeout_secs: u64,
    /// Earliest time the task may run.
    pub not_before: DateTime<Utc>,
}

impl Task {
    /// Create a task that may run immediately on its payload's default queue.
    #[must_use]
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: TaskId::generate(),
            queue: payload.default_queue().to_string(),
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            not_before: Utc::now(),
        }
    }

    /// Shorthand for a publish task.
    #[must_use]
    pub fn publish(item_id: impl Into<String>, origin: TaskOrigin) -> Self {
        Self::new(TaskPayload::PublishContent {
            item_id: item_id.into(),
            origin,
        })
    }

    /// Shorthand for an expire task.
    #[must_use]
    pub fn expire(item_id: impl Into<String>, origin: TaskOrigin) -> Self {
        Self::new(TaskPayload::ExpireContent {
            item_id: item_id.into(),
            origin,
        })
    }

    /// Run on a different queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the earliest run time.
    #[must_use]
    pub const fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    /// Routing tag.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A task as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// The task itself.
    pub task: Task,
    /// Zero-based delivery attempt.
    pub attempt: u32,
    /// Earliest time this delivery may run.
    pub deliver_at: DateTime<Utc>,
    /// When the task was first handed to the broker.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wrap a task for its first delivery.
    #[must_use]
    pub fn new(task: Task) -> Self {
        Self {
            deliver_at: task.not_before,
            task,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Envelope for the next delivery attempt.
    #[must_use]
    pub fn next_attempt(&self, deliver_at: DateTime<Utc>) -> Self {
        Self {
            task: self.task.clone(),
            attempt: self.attempt + 1,
            deliver_at,
            enqueued_at: self.enqueued_at,
        }
    }

    /// Task ID.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.task.id
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.task.queue
    }
}
