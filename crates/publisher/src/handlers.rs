//! Task handlers for the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use herald_queue::{HandlerError, HandlerRegistry, Task, TaskHandler, TaskOrigin, TaskPayload, TaskType};

use crate::error::{ErrorKind, PublishError};
use crate::store::ItemState;
use crate::token::TokenCache;
use crate::workflow::PublishingWorkflow;

/// Translate a publish error into a handler result.
///
/// Logic errors ("nothing to do") are success for scan-originated tasks,
/// since overlapping scans emit the same item more than once. Losing a
/// publish race is success for any task: the winning run publishes.
pub fn handler_result(err: PublishError, origin: TaskOrigin) -> Result<(), HandlerError> {
    if let PublishError::Superseded(_) = &err {
        tracing::info!(error = %err, "Publish handled by a concurrent run");
        return Ok(());
    }
    match err.kind() {
        ErrorKind::Logic if origin == TaskOrigin::Scan => {
            tracing::debug!(error = %err, "Nothing to do for scan task");
            Ok(())
        }
        ErrorKind::Logic | ErrorKind::PermanentExternal => Err(HandlerError::fatal(err.to_string())),
        ErrorKind::TransientExternal | ErrorKind::Infrastructure | ErrorKind::Cancelled => {
            Err(HandlerError::retryable(err.to_string()))
        }
    }
}

fn unexpected(task: &Task) -> HandlerError {
    HandlerError::fatal(format!("unexpected payload for {}", task.task_type()))
}

/// Runs [`TaskType::PublishContent`].
pub struct PublishHandler {
    workflow: Arc<PublishingWorkflow>,
}

impl PublishHandler {
    /// Create the handler.
    pub fn new(workflow: Arc<PublishingWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl TaskHandler for PublishHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let TaskPayload::PublishContent { item_id, origin } = &task.payload else {
            return Err(unexpected(task));
        };

        if *origin == TaskOrigin::Scan {
            let item = match self.workflow.item(item_id).await {
                Ok(item) => item,
                Err(e) => return handler_result(e, *origin),
            };
            if item.state() == ItemState::Expired || item.published_since_scheduled() {
                tracing::debug!(item_id = %item_id, "Already published for this schedule, skipping");
                return Ok(());
            }
        }

        match self.workflow.publish(item_id).await {
            Ok(_) => Ok(()),
            Err(e) => handler_result(e, *origin),
        }
    }
}

/// Runs [`TaskType::ExpireContent`].
pub struct ExpireHandler {
    workflow: Arc<PublishingWorkflow>,
}

impl ExpireHandler {
    /// Create the handler.
    pub fn new(workflow: Arc<PublishingWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl TaskHandler for ExpireHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let TaskPayload::ExpireContent { item_id, origin } = &task.payload else {
            return Err(unexpected(task));
        };

        match self.workflow.expire(item_id, Utc::now()).await {
            Ok(()) => Ok(()),
            Err(e) => handler_result(e, *origin),
        }
    }
}

/// Runs [`TaskType::RefreshCredential`].
pub struct RefreshCredentialHandler {
    tokens: Arc<TokenCache>,
}

impl RefreshCredentialHandler {
    /// Create the handler.
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TaskHandler for RefreshCredentialHandler {
    async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
        match self.tokens.refresh_token().await {
            Ok(_) => Ok(()),
            Err(e) => handler_result(e, TaskOrigin::Direct),
        }
    }
}

/// Registry with every publisher handler.
pub fn registry(workflow: &Arc<PublishingWorkflow>, tokens: &Arc<TokenCache>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            TaskType::PublishContent,
            Arc::new(PublishHandler::new(workflow.clone())),
        )
        .register(
            TaskType::ExpireContent,
            Arc::new(ExpireHandler::new(workflow.clone())),
        )
        .register(
            TaskType::RefreshCredential,
            Arc::new(RefreshCredentialHandler::new(tokens.clone())),
        )
}
