//! Application configuration.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// External publishing platform configuration.
    pub platform: PlatformConfig,
    /// In-call retry configuration for platform requests.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Periodic dispatcher configuration.
    #[serde(default)]
    pub cron: CronSettings,
    /// Asset handling configuration.
    pub assets: AssetSettings,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// External publishing platform configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform API.
    pub base_url: String,
    /// Application ID used to issue credentials.
    pub app_id: String,
    /// Application secret used to issue credentials.
    pub app_secret: String,
    /// Seconds subtracted from the issuer's credential lifetime.
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Platform error codes that are known to be transient.
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<i64>,
    /// Hosts that already serve platform-hosted media.
    #[serde(default)]
    pub media_hosts: Vec<String>,
}

/// In-call retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any retry delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max_retries(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Worker count per named queue.
    #[serde(default = "default_queue_allocations")]
    pub queues: BTreeMap<String, usize>,
    /// Seconds to wait for in-flight handlers on shutdown.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Transport retry delay before the first redelivery, in seconds.
    #[serde(default = "default_transport_initial_delay_secs")]
    pub retry_initial_delay_secs: u64,
    /// Transport retry delay cap, in seconds.
    #[serde(default = "default_transport_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    /// Maximum number of dead-letter entries kept.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queues: default_queue_allocations(),
            drain_timeout_secs: default_drain_timeout_secs(),
            retry_initial_delay_secs: default_transport_initial_delay_secs(),
            retry_max_delay_secs: default_transport_max_delay_secs(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

/// Periodic dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CronSettings {
    /// Whether this node runs the dispatcher at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval of the scheduled-publish scan, in seconds.
    #[serde(default = "default_scan_scheduled_interval_secs")]
    pub scan_scheduled_interval_secs: u64,
    /// Lookahead of the scheduled-publish scan, in seconds.
    #[serde(default = "default_schedule_lookahead_secs")]
    pub schedule_lookahead_secs: u64,
    /// How long past its schedule an unpublished item is still picked up, in seconds.
    #[serde(default = "default_catch_up_secs")]
    pub catch_up_secs: u64,
    /// Interval of the expiry scan, in seconds.
    #[serde(default = "default_scan_expiring_interval_secs")]
    pub scan_expiring_interval_secs: u64,
    /// Lookahead of the expiry scan, in seconds.
    #[serde(default = "default_expire_lookahead_secs")]
    pub expire_lookahead_secs: u64,
    /// Interval of the platform health check, in seconds.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Interval of the cleanup job, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Dead letters older than this are purged by cleanup.
    #[serde(default = "default_dead_letter_retention_days")]
    pub dead_letter_retention_days: u32,
    /// Lifetime of the leader lease, in seconds.
    #[serde(default = "default_leader_lease_secs")]
    pub leader_lease_secs: u64,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_scheduled_interval_secs: default_scan_scheduled_interval_secs(),
            schedule_lookahead_secs: default_schedule_lookahead_secs(),
            catch_up_secs: default_catch_up_secs(),
            scan_expiring_interval_secs: default_scan_expiring_interval_secs(),
            expire_lookahead_secs: default_expire_lookahead_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            dead_letter_retention_days: default_dead_letter_retention_days(),
            leader_lease_secs: default_leader_lease_secs(),
        }
    }
}

/// Asset handling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetSettings {
    /// Public URL prefix under which local assets are served.
    pub public_base_url: String,
    /// Directory that holds local asset files.
    pub media_root: PathBuf,
    /// Directory used for temporary downloads.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Maximum size of a downloaded third-party asset.
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: usize,
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "herald".to_string()
}

const fn default_token_safety_margin_secs() -> u64 {
    300
}

const fn default_request_timeout_secs() -> u64 {
    30
}

fn default_retryable_codes() -> Vec<i64> {
    vec![-1, 40001, 40014, 42001, 45009, 50001, -1000]
}

const fn default_retry_max_retries() -> u32 {
    3
}

const fn default_retry_initial_delay_ms() -> u64 {
    500
}

const fn default_retry_max_delay_ms() -> u64 {
    10_000
}

const fn default_backoff_factor() -> f64 {
    2.0
}

fn default_queue_allocations() -> BTreeMap<String, usize> {
    [
        ("critical", 6),
        ("domain-high", 3),
        ("domain-low", 2),
        ("analytics", 1),
        ("default", 1),
    ]
    .into_iter()
    .map(|(name, workers)| (name.to_string(), workers))
    .collect()
}

const fn default_drain_timeout_secs() -> u64 {
    30
}

const fn default_transport_initial_delay_secs() -> u64 {
    30
}

const fn default_transport_max_delay_secs() -> u64 {
    3600
}

const fn default_dead_letter_capacity() -> usize {
    10_000
}

const fn default_true() -> bool {
    true
}

const fn default_scan_scheduled_interval_secs() -> u64 {
    60
}

const fn default_schedule_lookahead_secs() -> u64 {
    300
}

const fn default_catch_up_secs() -> u64 {
    3600
}

const fn default_scan_expiring_interval_secs() -> u64 {
    3600
}

const fn default_expire_lookahead_secs() -> u64 {
    3600
}

const fn default_health_check_interval_secs() -> u64 {
    30
}

const fn default_cleanup_interval_secs() -> u64 {
    86_400
}

const fn default_dead_letter_retention_days() -> u32 {
    14
}

const fn default_leader_lease_secs() -> u64 {
    90
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("herald-scratch")
}

const fn default_max_download_bytes() -> usize {
    10 * 1024 * 1024
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `HERALD_ENV`)
    /// 4. Environment variables with `HERALD__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("HERALD_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        url = "postgres://localhost/herald"

        [redis]
        url = "redis://localhost:6379"

        [platform]
        base_url = "https://api.platform.example"
        app_id = "app"
        app_secret = "secret"

        [assets]
        public_base_url = "https://cdn.example.com/media"
        media_root = "/var/lib/herald/media"
    "#;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = parse(MINIMAL);

        assert_eq!(config.platform.token_safety_margin_secs, 300);
        assert!(config.platform.retryable_codes.contains(&45009));
        assert_eq!(config.worker.queues.get("critical"), Some(&6));
        assert_eq!(config.worker.queues.get("default"), Some(&1));
        assert!(config.cron.enabled);
        assert_eq!(config.cron.schedule_lookahead_secs, 300);
        assert_eq!(config.assets.max_download_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_queue_allocations_override() {
        let toml = format!("{MINIMAL}\n[worker.queues]\ncritical = 2\n");
        let config = parse(&toml);

        assert_eq!(config.worker.queues.len(), 1);
        assert_eq!(config.worker.queues.get("critical"), Some(&2));
    }
}
