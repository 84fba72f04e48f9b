//! Task consumption: handlers, per-delivery dispatch and the worker pool.

mod dispatch;
mod handler;
mod pool;

pub use dispatch::{Outcome, TaskDispatcher};
pub use handler::{HandlerError, HandlerRegistry, TaskHandler};
pub use pool::{PoolHealth, QueueHealth, WorkerPool, WorkerPoolConfig};

pub(crate) use dispatch::panic_message;
