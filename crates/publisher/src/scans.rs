//! Periodic jobs: due-item scans, the credential health check and cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_common::LocalStorage;
use herald_common::config::CronSettings;
use herald_queue::{CronJob, Task, TaskOrigin, TaskQueue};

use crate::error::{PublishError, PublishResult};
use crate::store::DomainStore;
use crate::token::TokenCache;

/// Job names.
pub mod jobs {
    /// Emits publish tasks for items about to be due.
    pub const SCAN_SCHEDULED: &str = "scan-scheduled";
    /// Emits expire tasks for items about to expire.
    pub const SCAN_EXPIRING: &str = "scan-expiring";
    /// Verifies a platform credential can be obtained.
    pub const HEALTH_CHECK: &str = "health-check";
    /// Purges old dead letters and stale scratch files.
    pub const CLEANUP: &str = "cleanup";
}

/// Scan windows.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How far ahead the publish scan looks.
    pub schedule_lookahead: Duration,
    /// How far behind its schedule an unpublished item is still picked up.
    /// Also how long a task stays claimed after its due time, so each
    /// schedule is emitted once.
    pub catch_up: Duration,
    /// How far ahead the expiry scan looks.
    pub expire_lookahead: Duration,
    /// Upper bound on items handled per scan.
    pub batch_size: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            schedule_lookahead: Duration::from_secs(5 * 60),
            catch_up: Duration::from_secs(60 * 60),
            expire_lookahead: Duration::from_secs(60 * 60),
            batch_size: 500,
        }
    }
}

/// Job intervals and retention.
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// Tick of [`jobs::SCAN_SCHEDULED`].
    pub scan_scheduled_interval: Duration,
    /// Tick of [`jobs::SCAN_EXPIRING`].
    pub scan_expiring_interval: Duration,
    /// Tick of [`jobs::HEALTH_CHECK`].
    pub health_check_interval: Duration,
    /// Tick of [`jobs::CLEANUP`].
    pub cleanup_interval: Duration,
    /// Dead letters older than this are purged.
    pub dead_letter_retention: Duration,
    /// Scratch files older than this are deleted.
    pub scratch_max_age: Duration,
    /// Scan windows.
    pub scan: ScanConfig,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            scan_scheduled_interval: Duration::from_secs(60),
            scan_expiring_interval: Duration::from_secs(60 * 60),
            health_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            dead_letter_retention: Duration::from_secs(7 * 24 * 60 * 60),
            scratch_max_age: Duration::from_secs(24 * 60 * 60),
            scan: ScanConfig::default(),
        }
    }
}

impl CronConfig {
    /// Build from configuration.
    #[must_use]
    pub fn from_settings(settings: &CronSettings) -> Self {
        Self {
            scan_scheduled_interval: Duration::from_secs(settings.scan_scheduled_interval_secs),
            scan_expiring_interval: Duration::from_secs(settings.scan_expiring_interval_secs),
            health_check_interval: Duration::from_secs(settings.health_check_interval_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            dead_letter_retention: Duration::from_secs(
                u64::from(settings.dead_letter_retention_days) * 24 * 60 * 60,
            ),
            scan: ScanConfig {
                schedule_lookahead: Duration::from_secs(settings.schedule_lookahead_secs),
                catch_up: Duration::from_secs(settings.catch_up_secs),
                expire_lookahead: Duration::from_secs(settings.expire_lookahead_secs),
                ..ScanConfig::default()
            },
            ..Self::default()
        }
    }
}

fn shift(now: DateTime<Utc>, by: Duration, forward: bool) -> PublishResult<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(by)
        .map_err(|e| PublishError::Config(format!("Window out of range: {e}")))?;
    let shifted = if forward {
        now.checked_add_signed(delta)
    } else {
        now.checked_sub_signed(delta)
    };
    shifted.ok_or_else(|| PublishError::Config(format!("Window out of range: {by:?}")))
}

/// Turns due items into scheduled tasks.
#[derive(Clone)]
pub struct Scanner {
    store: Arc<dyn DomainStore>,
    queue: TaskQueue,
    config: ScanConfig,
}

impl Scanner {
    /// Create a scanner.
    pub fn new(store: Arc<dyn DomainStore>, queue: TaskQueue, config: ScanConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Schedule one publish task per item due within the lookahead window,
    /// to run at the item's scheduled time.
    ///
    /// Items more than the catch-up window overdue are no longer picked up.
    /// Each (item, schedule) pair is emitted once, however many ticks see it.
    pub async fn scan_scheduled(&self, now: DateTime<Utc>) -> PublishResult<u64> {
        let since = shift(now, self.config.catch_up, false)?;
        let until = shift(now, self.config.schedule_lookahead, true)?;
        let items = self
            .store
            .due_for_publish(since, until, self.config.batch_size)
            .await?;

        let mut emitted = 0;
        for item in items {
            let Some(scheduled_at) = item.scheduled_at else {
                continue;
            };
            let key = format!("publish:{}:{}", item.id, scheduled_at.timestamp());
            let Some(task_id) = self
                .queue
                .schedule_once(
                    Task::publish(&item.id, TaskOrigin::Scan),
                    scheduled_at,
                    &key,
                    self.config.catch_up,
                )
                .await?
            else {
                continue;
            };
            tracing::debug!(item_id = %item.id, task_id = %task_id, scheduled_at = %scheduled_at, "Publish scheduled");
            emitted += 1;
        }

        if emitted > 0 {
            tracing::info!(emitted, until = %until, "Scheduled-publish scan");
        }
        Ok(emitted)
    }

    /// Schedule one expire task per item expiring within the lookahead window,
    /// to run at the item's expiry time.
    pub async fn scan_expiring(&self, now: DateTime<Utc>) -> PublishResult<u64> {
        let until = shift(now, self.config.expire_lookahead, true)?;
        let items = self
            .store
            .due_for_expiry(until, self.config.batch_size)
            .await?;

        let mut emitted = 0;
        for item in items {
            let Some(expires_at) = item.expires_at else {
                continue;
            };
            let key = format!("expire:{}:{}", item.id, expires_at.timestamp());
            let Some(task_id) = self
                .queue
                .schedule_once(
                    Task::expire(&item.id, TaskOrigin::Scan),
                    expires_at,
                    &key,
                    self.config.catch_up,
                )
                .await?
            else {
                continue;
            };
            tracing::debug!(item_id = %item.id, task_id = %task_id, expires_at = %expires_at, "Expiry scheduled");
            emitted += 1;
        }

        if emitted > 0 {
            tracing::info!(emitted, until = %until, "Expiry scan");
        }
        Ok(emitted)
    }
}

/// Health check and cleanup.
#[derive(Clone)]
pub struct Maintenance {
    tokens: Arc<TokenCache>,
    queue: TaskQueue,
    scratch: LocalStorage,
    dead_letter_retention: Duration,
    scratch_max_age: Duration,
}

impl Maintenance {
    /// Create the maintenance jobs' state.
    pub fn new(tokens: Arc<TokenCache>, queue: TaskQueue, scratch: LocalStorage, config: &CronConfig) -> Self {
        Self {
            tokens,
            queue,
            scratch,
            dead_letter_retention: config.dead_letter_retention,
            scratch_max_age: config.scratch_max_age,
        }
    }

    /// Make sure a credential can be obtained.
    pub async fn health_check(&self) -> PublishResult<u64> {
        self.tokens.get_token().await?;
        Ok(1)
    }

    /// Purge expired dead letters and sweep the scratch directory.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> PublishResult<u64> {
        let cutoff = shift(now, self.dead_letter_retention, false)?;
        let purged = self.queue.purge_dead_letters(cutoff).await?;
        let swept = self.scratch.sweep_older_than(self.scratch_max_age).await?;

        tracing::info!(purged, swept, "Cleanup finished");
        Ok(purged + swept)
    }
}

/// The dispatcher's job set.
pub fn cron_jobs(scanner: &Scanner, maintenance: &Maintenance, config: &CronConfig) -> Vec<CronJob> {
    let scheduled = scanner.clone();
    let expiring = scanner.clone();
    let health = maintenance.clone();
    let cleanup = maintenance.clone();

    vec![
        CronJob::new(jobs::SCAN_SCHEDULED, config.scan_scheduled_interval, move || {
            let scanner = scheduled.clone();
            async move { Ok(scanner.scan_scheduled(Utc::now()).await?) }
        }),
        CronJob::new(jobs::SCAN_EXPIRING, config.scan_expiring_interval, move || {
            let scanner = expiring.clone();
            async move { Ok(scanner.scan_expiring(Utc::now()).await?) }
        }),
        CronJob::new(jobs::HEALTH_CHECK, config.health_check_interval, move || {
            let maintenance = health.clone();
            async move { Ok(maintenance.health_check().await?) }
        }),
        CronJob::new(jobs::CLEANUP, config.cleanup_interval, move || {
            let maintenance = cleanup.clone();
            async move { Ok(maintenance.cleanup(Utc::now()).await?) }
        }),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let config = CronConfig::from_settings(&CronSettings::default());

        assert_eq!(config.scan_scheduled_interval, Duration::from_secs(60));
        assert_eq!(config.scan.schedule_lookahead, Duration::from_secs(300));
        assert_eq!(config.scan.catch_up, Duration::from_secs(3600));
        assert_eq!(config.scan.expire_lookahead, Duration::from_secs(3600));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_shift() {
        let now = Utc::now();
        assert_eq!(
            shift(now, Duration::from_secs(300), true).unwrap(),
            now + chrono::Duration::minutes(5)
        );
        assert_eq!(
            shift(now, Duration::from_secs(60), false).unwrap(),
            now - chrono::Duration::minutes(1)
        );
        assert!(shift(now, Duration::MAX, true).is_err());
    }
}
