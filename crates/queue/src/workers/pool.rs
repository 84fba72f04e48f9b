//! Worker pool over apalis.
//!
//! One apalis worker per named queue, each with its own concurrency limit so a
//! busy queue can never starve the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use apalis::prelude::*;
use herald_common::config::WorkerSettings;
use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::dispatch::TaskDispatcher;
use super::handler::HandlerRegistry;
use crate::broker::RedisBroker;
use crate::error::{QueueError, QueueResult};
use crate::retry::RetryConfig;
use crate::stats::{PoolStats, QueueSnapshot};
use crate::task::{TaskEnvelope, queues};

/// Extra time granted to the monitor after the drain timeout before it is aborted.
const FORCE_STOP_GRACE: Duration = Duration::from_secs(5);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrency per named queue.
    pub queues: BTreeMap<String, usize>,
    /// How long in-flight handlers may run after `stop()`.
    pub drain_timeout: Duration,
    /// Transport retry backoff.
    pub retry: RetryConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let queues = [
            (queues::CRITICAL, 6),
            (queues::DOMAIN_HIGH, 3),
            (queues::DOMAIN_LOW, 2),
            (queues::ANALYTICS, 1),
            (queues::DEFAULT, 1),
        ]
        .into_iter()
        .map(|(name, n)| (name.to_string(), n))
        .collect();

        Self {
            queues,
            drain_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Build from configuration.
    #[must_use]
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            queues: settings.queues.clone(),
            drain_timeout: Duration::from_secs(settings.drain_timeout_secs),
            retry: RetryConfig {
                initial_delay: Duration::from_secs(settings.retry_initial_delay_secs),
                max_delay: Duration::from_secs(settings.retry_max_delay_secs),
                ..RetryConfig::default()
            },
        }
    }

    /// Every queue needs at least one worker.
    pub fn validate(&self) -> QueueResult<()> {
        if self.queues.is_empty() {
            return Err(QueueError::InvalidConfig("No queues configured".to_string()));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, n)| **n == 0) {
            return Err(QueueError::InvalidConfig(format!(
                "Queue {name} needs at least one worker"
            )));
        }
        Ok(())
    }
}

/// Health of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// Configured concurrency.
    pub concurrency: usize,
    /// Counters since start.
    #[serde(flatten)]
    pub stats: QueueSnapshot,
}

/// Pool health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// Whether the monitor is running.
    pub running: bool,
    /// Per-queue health.
    pub queues: BTreeMap<String, QueueHealth>,
}

struct RunningPool {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Consumes every configured queue and dispatches tasks to handlers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<RedisBroker>,
    dispatcher: Arc<TaskDispatcher>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<RunningPool>>,
}

impl WorkerPool {
    /// Create a pool; nothing runs until [`WorkerPool::start`].
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<RedisBroker>,
        registry: HandlerRegistry,
    ) -> QueueResult<Self> {
        config.validate()?;

        if let Some(missing) = config
            .queues
            .keys()
            .find(|q| broker.storage(q.as_str()).is_none())
        {
            return Err(QueueError::UnknownQueue(missing.clone()));
        }

        let stats = Arc::new(PoolStats::new(config.queues.keys().map(String::as_str)));
        let dispatcher = Arc::new(TaskDispatcher::new(
            broker.clone(),
            registry,
            config.retry.clone(),
            stats,
        ));

        Ok(Self {
            config,
            broker,
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Start consuming. Fails if the pool is already running.
    pub async fn start(&self) -> QueueResult<()> {
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let mut monitor = Monitor::new();
        for (queue, &concurrency) in &self.config.queues {
            let storage = self
                .broker
                .storage(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.clone()))?;

            let worker = WorkerBuilder::new(format!("herald-{queue}"))
                .enable_tracing()
                .concurrency(concurrency)
                .data(self.dispatcher.clone())
                .backend(storage)
                .build_fn(run_task);
            monitor = monitor.register(worker);

            tracing::info!(queue = %queue, concurrency, "Worker registered");
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let monitor = monitor.shutdown_timeout(self.config.drain_timeout);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let join = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.await;
                Ok(())
            };
            if let Err(e) = monitor.run_with_signal(signal).await {
                tracing::error!(error = %e, "Worker monitor failed");
            }
            running.store(false, Ordering::SeqCst);
        });

        *slot = Some(RunningPool {
            shutdown: shutdown_tx,
            join,
        });
        tracing::info!(queues = self.config.queues.len(), "Worker pool started");
        Ok(())
    }

    /// Stop taking new tasks, wait for in-flight handlers up to the drain
    /// timeout, then force-stop.
    pub async fn stop(&self) {
        let Some(RunningPool { shutdown, mut join }) = self.handle.lock().await.take() else {
            return;
        };

        tracing::info!(drain_timeout_secs = self.config.drain_timeout.as_secs(), "Stopping worker pool");
        let _ = shutdown.send(());

        match tokio::time::timeout(self.config.drain_timeout + FORCE_STOP_GRACE, &mut join).await {
            Ok(Ok(())) => tracing::info!("Worker pool drained"),
            Ok(Err(e)) => tracing::error!(error = %e, "Worker pool task failed"),
            Err(_) => {
                tracing::warn!("Drain timeout exceeded, aborting workers");
                join.abort();
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> PoolHealth {
        let snapshot = self.dispatcher.stats().snapshot();
        let queues = self
            .config
            .queues
            .iter()
            .map(|(name, &concurrency)| {
                let stats = snapshot.get(name).copied().unwrap_or_default();
                (name.clone(), QueueHealth { concurrency, stats })
            })
            .collect();

        PoolHealth {
            running: self.running.load(Ordering::SeqCst),
            queues,
        }
    }
}

/// apalis entry point for every queue.
async fn run_task(envelope: TaskEnvelope, dispatcher: Data<Arc<TaskDispatcher>>) -> Result<(), Error> {
    let task_id = envelope.id().clone();
    match dispatcher.process(envelope).await {
        Ok(_) => Ok(()),
        Err(e) => {
            // Leave the delivery to apalis so the task is not lost
            tracing::error!(task_id = %task_id, error = %e, "Broker failure while processing task");
            let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
            Err(Error::Failed(boxed.into()))
        }
    }
}
