//! Periodic job dispatcher.
//!
//! Named jobs run on fixed intervals while this process holds the leader
//! lease. Every job is wrapped so that a panic is caught and logged, and so
//! that a tick arriving while the previous run is still going is skipped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::lease::LeaderLease;
use crate::workers::panic_message;

/// Error type returned by jobs.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one job run: how many items it touched.
pub type JobResult = Result<u64, JobError>;

/// A job's execution closure.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, JobResult> + Send + Sync>;

/// A named job with its interval.
#[derive(Clone)]
pub struct CronJob {
    name: String,
    interval: Duration,
    run: JobFn,
}

impl CronJob {
    /// Create a job from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            run: Arc::new(move || f().boxed()),
        }
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

/// Catch panics raised by a job and report them as errors.
pub fn recover(name: &str, job: JobFn) -> JobFn {
    let name: Arc<str> = Arc::from(name);
    Arc::new(move || {
        let job = job.clone();
        let name = name.clone();
        async move {
            match AssertUnwindSafe(job()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(job = %name, panic = %message, "Cron job panicked");
                    Err(format!("job {name} panicked: {message}").into())
                }
            }
        }
        .boxed()
    })
}

/// Skip a run while the previous one is still in progress.
pub fn skip_if_still_running(name: &str, job: JobFn) -> JobFn {
    let name: Arc<str> = Arc::from(name);
    let running = Arc::new(AtomicBool::new(false));

    Arc::new(move || {
        let job = job.clone();
        let name = name.clone();
        let running = running.clone();
        async move {
            if running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                tracing::debug!(job = %name, "Previous run still in progress, skipping");
                return Ok(0);
            }
            let _guard = RunningGuard(running);
            job().await
        }
        .boxed()
    })
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs registered jobs on their intervals.
#[derive(Default)]
pub struct CronDispatcher {
    jobs: Vec<CronJob>,
}

impl CronDispatcher {
    /// Dispatcher with no jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job.
    #[must_use]
    pub fn register(mut self, job: CronJob) -> Self {
        self.jobs.push(job);
        self
    }

    /// Registered job names.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(CronJob::name)
    }

    /// Start ticking. Jobs only run while `lease` is held.
    pub async fn start(self, lease: Arc<dyn LeaderLease>) -> CronHandle {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let leader = Arc::new(AtomicBool::new(false));

        refresh_leadership(lease.as_ref(), &leader).await;
        tracker.spawn(renew_lease(lease, leader.clone(), token.clone()));

        for job in self.jobs {
            let run = skip_if_still_running(&job.name, recover(&job.name, job.run));
            tracker.spawn(tick_loop(
                job.name,
                job.interval,
                run,
                leader.clone(),
                tracker.clone(),
                token.clone(),
            ));
        }

        tracing::info!("Cron dispatcher started");
        CronHandle {
            token,
            tracker,
            leader,
        }
    }
}

async fn refresh_leadership(lease: &dyn LeaderLease, leader: &AtomicBool) {
    let held = match lease.try_acquire().await {
        Ok(held) => held,
        Err(e) => {
            tracing::warn!(error = %e, "Leader lease check failed");
            false
        }
    };

    let was = leader.swap(held, Ordering::AcqRel);
    if was != held {
        tracing::info!(leader = held, "Cron leadership changed");
    }
}

async fn renew_lease(lease: Arc<dyn LeaderLease>, leader: Arc<AtomicBool>, token: CancellationToken) {
    let mut ticker = tokio::time::interval((lease.ttl() / 3).max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => refresh_leadership(lease.as_ref(), &leader).await,
        }
    }

    leader.store(false, Ordering::Release);
    if let Err(e) = lease.release().await {
        tracing::warn!(error = %e, "Failed to release leader lease");
    }
}

async fn tick_loop(
    name: String,
    interval: Duration,
    run: JobFn,
    leader: Arc<AtomicBool>,
    tracker: TaskTracker,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                if !leader.load(Ordering::Acquire) {
                    tracing::trace!(job = %name, "Not the leader, skipping tick");
                    continue;
                }

                let run = run.clone();
                let name = name.clone();
                tracker.spawn(async move {
                    match run().await {
                        Ok(0) => tracing::trace!(job = %name, "Cron job finished"),
                        Ok(count) => tracing::info!(job = %name, count, "Cron job finished"),
                        Err(e) => tracing::error!(job = %name, error = %e, "Cron job failed"),
                    }
                });
            }
        }
    }
    tracing::debug!(job = %name, "Cron loop stopped");
}

/// Handle to a running dispatcher.
pub struct CronHandle {
    token: CancellationToken,
    tracker: TaskTracker,
    leader: Arc<AtomicBool>,
}

impl CronHandle {
    /// Whether this process currently holds the lease.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Stop ticking and wait for in-flight runs to finish.
    pub async fn stop(self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Cron dispatcher stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::lease::SingleNode;

    async fn explode() -> JobResult {
        panic!("boom")
    }

    fn counting_job(counter: Arc<AtomicU64>, work: Duration) -> JobFn {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                Ok(1)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_recover_turns_panic_into_error() {
        let job: JobFn = Arc::new(|| explode().boxed());
        let wrapped = recover("panicky", job);

        let err = wrapped().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_if_still_running() {
        let counter = Arc::new(AtomicU64::new(0));
        let wrapped = skip_if_still_running(
            "slow",
            counting_job(counter.clone(), Duration::from_secs(10)),
        );

        let first = tokio::spawn(wrapped());
        tokio::task::yield_now().await;
        let second = wrapped().await.unwrap();

        assert_eq!(second, 0);
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Guard released after the first run
        assert_eq!(wrapped().await.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_guard_released_after_panic() {
        let job: JobFn = Arc::new(|| explode().boxed());
        let wrapped = skip_if_still_running("panicky", recover("panicky", job));

        assert!(wrapped().await.is_err());
        assert!(wrapped().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_never_overlaps_itself() {
        let counter = Arc::new(AtomicU64::new(0));
        let interval = Duration::from_secs(10);
        let run = counting_job(counter.clone(), Duration::from_secs(25));

        let dispatcher = CronDispatcher::new().register(CronJob {
            name: "slow".to_string(),
            interval,
            run,
        });
        let handle = dispatcher.start(Arc::new(SingleNode)).await;

        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.stop().await;

        // Runs start at 0s and 30s; ticks at 10s and 20s are skipped
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_does_not_stop_others() {
        let counter = Arc::new(AtomicU64::new(0));
        let dispatcher = CronDispatcher::new()
            .register(CronJob::new("panicky", Duration::from_secs(5), explode))
            .register(CronJob {
                name: "steady".to_string(),
                interval: Duration::from_secs(5),
                run: counting_job(counter.clone(), Duration::ZERO),
            });
        let handle = dispatcher.start(Arc::new(SingleNode)).await;

        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.stop().await;

        // Ticks at 0s, 5s and 10s
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    struct NeverLeader;

    #[async_trait::async_trait]
    impl LeaderLease for NeverLeader {
        async fn try_acquire(&self) -> crate::error::QueueResult<bool> {
            Ok(false)
        }

        async fn release(&self) -> crate::error::QueueResult<()> {
            Ok(())
        }

        fn ttl(&self) -> Duration {
            Duration::from_secs(30)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_does_not_run_jobs() {
        let counter = Arc::new(AtomicU64::new(0));
        let dispatcher = CronDispatcher::new().register(CronJob {
            name: "scan".to_string(),
            interval: Duration::from_secs(1),
            run: counting_job(counter.clone(), Duration::ZERO),
        });
        let handle = dispatcher.start(Arc::new(NeverLeader)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_leader());
        handle.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
