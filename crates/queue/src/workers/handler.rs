//! Typed task handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::task::{Task, TaskType};

/// Structured failure returned by a handler.
///
/// `retryable` decides whether the transport schedules another attempt or
/// dead-letters the task straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Human-readable cause, kept on the dead letter.
    pub message: String,
    /// Whether a later attempt may succeed.
    pub retryable: bool,
}

impl HandlerError {
    /// A failure worth another attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "retryable" } else { "fatal" };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Executes one task type.
///
/// Deliveries are at-least-once, so implementations must be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task.
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

/// Maps task types to their handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `task_type` to `handler`, replacing any earlier registration.
    #[must_use]
    pub fn register(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        if self.handlers.insert(task_type, handler).is_some() {
            tracing::warn!(task_type = %task_type, "Replacing registered handler");
        }
        self
    }

    /// Handler for a task type.
    #[must_use]
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Registered task types.
    pub fn task_types(&self) -> impl Iterator<Item = TaskType> + '_ {
        self.handlers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_routes_by_type() {
        let registry = HandlerRegistry::new().register(TaskType::PublishContent, Arc::new(Noop));

        assert!(registry.get(TaskType::PublishContent).is_some());
        assert!(registry.get(TaskType::ExpireContent).is_none());
        assert_eq!(registry.task_types().count(), 1);
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::retryable("busy").to_string(), "retryable: busy");
        assert_eq!(HandlerError::fatal("gone").to_string(), "fatal: gone");
    }
}
