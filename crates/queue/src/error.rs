//! Queue error types.

use herald_common::AppError;
use thiserror::Error;

/// Queue result type.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by the task queue, the broker and the worker pool.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or rejected the command.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A task or dead-letter entry could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A task named a queue the broker does not serve.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The worker pool was started twice.
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Broker(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidConfig(msg) => Self::Config(msg),
            other => Self::Queue(other.to_string()),
        }
    }
}
