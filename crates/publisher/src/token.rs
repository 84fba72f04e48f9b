//! Platform credential cache.
//!
//! The cache is an owned component: create one per platform account at
//! startup, share it by `Arc`, and drop it on shutdown. Readers never see a
//! half-written credential, and concurrent misses collapse into one issue call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PublishResult;
use crate::retry::RetryEngine;

/// A credential as returned by the issuing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// Bearer token.
    pub token: String,
    /// Lifetime reported by the issuer.
    pub ttl: Duration,
}

/// Issues fresh credentials.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Exchange the account secret for a token. Failures are returned as
    /// platform errors so the retry engine can classify them.
    async fn issue(&self) -> PublishResult<IssuedCredential>;
}

/// A cached credential.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    /// Bearer token.
    pub value: String,
    /// When it was stored.
    pub issued_at: Instant,
    /// When the issuer says it stops working.
    pub expires_at: Instant,
    refresh_at: Instant,
}

impl CachedCredential {
    fn new(issued: IssuedCredential, now: Instant, margin: Duration) -> Self {
        // Short-lived tokens are refreshed halfway through instead
        let usable = if issued.ttl > margin {
            issued.ttl - margin
        } else {
            issued.ttl / 2
        };

        Self {
            value: issued.token,
            issued_at: now,
            expires_at: now + issued.ttl,
            refresh_at: now + usable,
        }
    }

    /// Whether the credential may still be handed out.
    #[must_use]
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

/// Token cache settings.
#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    /// Refresh this long before the issuer's expiry.
    pub safety_margin: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
        }
    }
}

/// Caches the platform credential.
pub struct TokenCache {
    issuer: Arc<dyn CredentialIssuer>,
    retry: RetryEngine,
    config: TokenCacheConfig,
    shutdown: CancellationToken,
    current: RwLock<Option<CachedCredential>>,
    refresh: Mutex<()>,
}

impl TokenCache {
    /// Create an empty cache. Cancelling `shutdown` aborts issue retries.
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        retry: RetryEngine,
        config: TokenCacheConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            issuer,
            retry,
            config,
            shutdown,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Current token, issuing a new one if the cached one is missing or due.
    pub async fn get_token(&self) -> PublishResult<String> {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }
        self.fetch().await
    }

    /// Drop the cached token and issue a new one.
    pub async fn refresh_token(&self) -> PublishResult<String> {
        let _guard = self.refresh.lock().await;
        self.invalidate().await;
        self.fetch().await
    }

    /// Drop the cached token.
    pub async fn invalidate(&self) {
        if self.current.write().await.take().is_some() {
            tracing::debug!("Platform credential invalidated");
        }
    }

    /// Drop the cached token only if it is still `rejected`.
    ///
    /// A caller that saw its token rejected must not discard a newer one
    /// another caller has already fetched. Returns whether anything was dropped.
    pub async fn invalidate_if(&self, rejected: &str) -> bool {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|c| c.value == rejected) {
            *current = None;
            tracing::debug!("Rejected platform credential invalidated");
            true
        } else {
            false
        }
    }

    /// Snapshot of the cached credential.
    pub async fn cached(&self) -> Option<CachedCredential> {
        self.current.read().await.clone()
    }

    async fn fresh_token(&self) -> Option<String> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|c| c.is_fresh(Instant::now()))
            .map(|c| c.value.clone())
    }

    async fn fetch(&self) -> PublishResult<String> {
        let issued = self
            .retry
            .execute(&self.shutdown, || self.issuer.issue())
            .await?;

        let credential =
            CachedCredential::new(issued, Instant::now(), self.config.safety_margin);
        let token = credential.value.clone();
        tracing::info!(
            ttl_secs = credential.expires_at.duration_since(credential.issued_at).as_secs(),
            "Platform credential issued"
        );

        *self.current.write().await = Some(credential);
        Ok(token)
    }
}
