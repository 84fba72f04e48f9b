//! Leader lease for singleton background work.
//!
//! Only the holder of the lease runs periodic jobs. The Redis lease is a key
//! holding the owner's identity with a TTL; the owner renews it on every
//! check and releases it on shutdown, so another node takes over within one
//! TTL if the holder dies.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::QueueResult;

/// Decides whether this process is the active instance.
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire the lease or renew it if already held. Returns whether this
    /// process holds it afterwards.
    async fn try_acquire(&self) -> QueueResult<bool>;

    /// Give the lease up if held.
    async fn release(&self) -> QueueResult<()>;

    /// How long a lease lasts without renewal.
    fn ttl(&self) -> Duration;
}

/// Lease for single-node deployments: always the leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleNode;

#[async_trait]
impl LeaderLease for SingleNode {
    async fn try_acquire(&self) -> QueueResult<bool> {
        Ok(true)
    }

    async fn release(&self) -> QueueResult<()> {
        Ok(())
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(60)
    }
}

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis-backed lease shared by every node of a deployment.
#[derive(Clone)]
pub struct RedisLeaderLease {
    conn: ConnectionManager,
    key: String,
    holder: String,
    ttl: Duration,
}

impl RedisLeaderLease {
    /// Create a lease on `key` identified by `holder`.
    pub fn new(
        conn: ConnectionManager,
        key: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            conn,
            key: key.into(),
            holder: holder.into(),
            ttl,
        }
    }

    /// Identity written into the lease key.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl LeaderLease for RedisLeaderLease {
    async fn try_acquire(&self) -> QueueResult<bool> {
        let mut conn = self.conn.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.holder)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis())
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            tracing::info!(holder = %self.holder, key = %self.key, "Leader lease acquired");
            return Ok(true);
        }

        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(&self.holder)
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.holder)
            .invoke_async(&mut conn)
            .await?;

        if released == 1 {
            tracing::info!(holder = %self.holder, "Leader lease released");
        }
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
