//! herald entry point.
//!
//! Wires the worker pool and, when enabled, the cron dispatcher, then waits
//! for a shutdown signal and stops them in order: cron first so no new scans
//! emit work, then the pool so in-flight handlers can drain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use herald_common::{Config, IdGenerator, LocalStorage};
use herald_db::repositories::{AssetRepository, ContentItemRepository};
use herald_publisher::{
    ContentPreprocessor, CronConfig, DbAssetStore, DbDomainStore, HttpCredentialIssuer,
    HttpFetcher, HttpPlatformClient, Maintenance, PreprocessConfig, PublishingWorkflow,
    RetryEngine, RetryPolicy, Scanner, TokenCache, TokenCacheConfig, build_http_client,
    cron_jobs, registry,
};
use herald_queue::{CronDispatcher, RedisBroker, RedisLeaderLease, TaskQueue, WorkerPool, WorkerPoolConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "herald=debug,apalis=info".into());
    let json = std::env::var("HERALD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting herald...");

    let config = Config::load().context("Failed to load configuration")?;

    // Database
    let db = Arc::new(herald_db::init(&config).await?);
    info!("Connected to database");
    herald_db::migrate(&db).await?;
    info!("Migrations completed");

    // Broker
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .context("Invalid Redis URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;

    let pool_config = WorkerPoolConfig::from_settings(&config.worker);
    let broker = Arc::new(
        RedisBroker::new(
            redis_conn.clone(),
            &config.redis.prefix,
            pool_config.queues.keys().cloned(),
        )
        .with_dead_letter_capacity(config.worker.dead_letter_capacity),
    );
    let task_queue = TaskQueue::new(broker.clone());
    info!(prefix = %config.redis.prefix, "Connected to Redis broker");

    // Platform
    let shutdown = CancellationToken::new();
    let retry = RetryEngine::new(RetryPolicy::from_settings(
        &config.retry,
        &config.platform.retryable_codes,
    )?);
    let http = build_http_client(Duration::from_secs(config.platform.request_timeout_secs))?;
    let base_url = Url::parse(&config.platform.base_url).context("Invalid platform.base_url")?;

    let issuer = Arc::new(HttpCredentialIssuer::new(
        http.clone(),
        base_url.clone(),
        config.platform.app_id.clone(),
        config.platform.app_secret.clone(),
    ));
    let tokens = Arc::new(TokenCache::new(
        issuer,
        retry.clone(),
        TokenCacheConfig {
            safety_margin: Duration::from_secs(config.platform.token_safety_margin_secs),
        },
        shutdown.clone(),
    ));
    let platform = Arc::new(HttpPlatformClient::new(
        http.clone(),
        base_url,
        tokens.clone(),
        retry,
        shutdown.clone(),
    ));

    // Publishing
    let scratch = LocalStorage::new(config.assets.scratch_dir.clone());
    let assets = Arc::new(DbAssetStore::new(
        AssetRepository::new(db.clone()),
        Arc::new(LocalStorage::new(config.assets.media_root.clone())),
    ));
    let store = Arc::new(DbDomainStore::new(ContentItemRepository::new(db.clone())));
    let preprocessor = Arc::new(ContentPreprocessor::new(
        platform.clone(),
        assets,
        Arc::new(HttpFetcher::new(http, config.assets.max_download_bytes)),
        Arc::new(scratch.clone()),
        PreprocessConfig {
            public_base_url: config.assets.public_base_url.clone(),
            media_hosts: config.platform.media_hosts.clone(),
        },
    ));
    let workflow = Arc::new(PublishingWorkflow::new(store.clone(), platform, preprocessor));

    // Workers
    let pool = WorkerPool::new(pool_config, broker, registry(&workflow, &tokens))?;
    pool.start().await?;

    // Cron
    let cron = if config.cron.enabled {
        let cron_config = CronConfig::from_settings(&config.cron);
        let scanner = Scanner::new(store, task_queue.clone(), cron_config.scan.clone());
        let maintenance = Maintenance::new(tokens.clone(), task_queue, scratch, &cron_config);
        let dispatcher = cron_jobs(&scanner, &maintenance, &cron_config)
            .into_iter()
            .fold(CronDispatcher::new(), CronDispatcher::register);

        let lease = Arc::new(RedisLeaderLease::new(
            redis_conn,
            format!("{}:cron:leader", config.redis.prefix),
            format!("{}-{}", std::process::id(), IdGenerator::new().generate()),
            Duration::from_secs(config.cron.leader_lease_secs),
        ));
        Some(dispatcher.start(lease).await)
    } else {
        info!("Cron dispatcher disabled on this node");
        None
    };

    info!("herald is running");
    shutdown_signal().await;

    if let Some(cron) = cron {
        cron.stop().await;
    }
    pool.stop().await;
    shutdown.cancel();

    match serde_json::to_string(&pool.health()) {
        Ok(health) => info!(health = %health, "Shutdown complete"),
        Err(_) => info!("Shutdown complete"),
    }
    Ok(())
}
