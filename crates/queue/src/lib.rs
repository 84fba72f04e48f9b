//! Task scheduling and execution for herald.
//!
//! - **Tasks**: typed, immutable units of work routed to named queues
//! - **`TaskQueue`**: producer API (`schedule_at`, `schedule_in`, `enqueue`, `cancel`)
//! - **Broker**: durable storage on Redis via apalis, or in memory for tests
//! - **Workers**: per-queue concurrency, timeouts, transport retry and dead letters
//! - **Cron**: leader-gated periodic jobs with panic recovery and overlap skipping

pub mod broker;
pub mod cron;
pub mod error;
pub mod lease;
pub mod memory;
pub mod retry;
pub mod stats;
pub mod task;
pub mod task_queue;
pub mod workers;

pub use broker::{Broker, RedisBroker};
pub use cron::{
    CronDispatcher, CronHandle, CronJob, JobError, JobFn, JobResult, recover,
    skip_if_still_running,
};
pub use error::{QueueError, QueueResult};
pub use lease::{LeaderLease, RedisLeaderLease, SingleNode};
pub use memory::MemoryBroker;
pub use retry::{DeadLetterEntry, RetryConfig};
pub use stats::{PoolStats, QueueSnapshot, QueueStats};
pub use task::{Task, TaskEnvelope, TaskId, TaskOrigin, TaskPayload, TaskType, queues};
pub use task_queue::TaskQueue;
pub use workers::{
    HandlerError, HandlerRegistry, Outcome, PoolHealth, QueueHealth, TaskDispatcher,
    TaskHandler, WorkerPool, WorkerPoolConfig,
};
