//! Ports to the domain store and the asset store, with database adapters.

#![allow(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_common::{AppError, FileStore};
use herald_db::entities::{asset, content_item};
use herald_db::repositories::{AssetRepository, ContentItemRepository};

use crate::client::{PublishReceipt, UploadedAsset};
use crate::error::{PublishError, PublishResult};

/// Publication state, derived from an item's external linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// No external draft.
    Draft,
    /// A draft exists on the platform.
    DraftCreated,
    /// The draft was submitted.
    Published,
    /// Terminal.
    Expired,
}

/// The fields of a content item the publisher reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub digest: Option<String>,
    pub body: String,
    pub cover_asset_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub external_draft_id: Option<String>,
    pub last_published_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ItemState {
        if self.expired_at.is_some() {
            ItemState::Expired
        } else if self.last_published_at.is_some() {
            ItemState::Published
        } else if self.external_draft_id.is_some() {
            ItemState::DraftCreated
        } else {
            ItemState::Draft
        }
    }

    /// Whether the item has been published since it was last scheduled.
    #[must_use]
    pub fn published_since_scheduled(&self) -> bool {
        match (self.last_published_at, self.scheduled_at) {
            (Some(published), Some(scheduled)) => published >= scheduled,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl From<content_item::Model> for ContentItem {
    fn from(m: content_item::Model) -> Self {
        Self {
            id: m.id,
            title: m.title,
            author: m.author,
            digest: m.digest,
            body: m.body,
            cover_asset_id: m.cover_asset_id,
            scheduled_at: m.scheduled_at.map(Into::into),
            expires_at: m.expires_at.map(Into::into),
            external_draft_id: m.external_draft_id.filter(|id| !id.is_empty()),
            last_published_at: m.last_published_at.map(Into::into),
            expired_at: m.expired_at.map(Into::into),
        }
    }
}

/// A locally hosted asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: String,
    pub storage_key: String,
    pub url: String,
    pub content_type: String,
    pub platform_url: Option<String>,
    pub platform_media_id: Option<String>,
}

impl From<asset::Model> for Asset {
    fn from(m: asset::Model) -> Self {
        Self {
            id: m.id,
            storage_key: m.storage_key,
            url: m.url,
            content_type: m.content_type,
            platform_url: m.platform_url,
            platform_media_id: m.platform_media_id,
        }
    }
}

/// Reads due items and persists external linkage.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Load an item.
    async fn get_item(&self, id: &str) -> PublishResult<ContentItem>;

    /// Items scheduled within `since..=until` and not yet published for that schedule.
    async fn due_for_publish(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: u64,
    ) -> PublishResult<Vec<ContentItem>>;

    /// Live items expiring on or before `until`.
    async fn due_for_expiry(&self, until: DateTime<Utc>, limit: u64) -> PublishResult<Vec<ContentItem>>;

    /// Swap the external draft ID from `expected` to `draft_id`.
    ///
    /// Returns `false`, leaving the item untouched, when the stored draft is
    /// no longer `expected`.
    async fn set_external_draft(
        &self,
        id: &str,
        expected: Option<&str>,
        draft_id: &str,
    ) -> PublishResult<bool>;

    /// Record a successful publish submission.
    async fn mark_published(
        &self,
        id: &str,
        at: DateTime<Utc>,
        receipt: &PublishReceipt,
    ) -> PublishResult<()>;

    /// Mark an item expired.
    async fn mark_expired(&self, id: &str, at: DateTime<Utc>) -> PublishResult<()>;
}

/// Reads local assets and remembers their platform copies.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Find an asset by its local public URL.
    async fn find_by_url(&self, url: &str) -> PublishResult<Option<Asset>>;

    /// Find an asset by ID.
    async fn find_by_id(&self, id: &str) -> PublishResult<Option<Asset>>;

    /// Read the asset's bytes.
    async fn read(&self, asset: &Asset) -> PublishResult<Bytes>;

    /// Remember the platform copy so later runs skip the upload.
    async fn record_upload(&self, id: &str, uploaded: &UploadedAsset) -> PublishResult<()>;
}

fn not_found(err: AppError) -> PublishError {
    match err {
        AppError::NotFound(msg) => PublishError::NotFound(msg),
        AppError::Conflict(msg) => PublishError::InvalidState(msg),
        other => PublishError::Store(other),
    }
}

/// [`DomainStore`] over the `content_item` table.
#[derive(Clone)]
pub struct DbDomainStore {
    repo: ContentItemRepository,
}

impl DbDomainStore {
    /// Create the adapter.
    #[must_use]
    pub const fn new(repo: ContentItemRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DomainStore for DbDomainStore {
    async fn get_item(&self, id: &str) -> PublishResult<ContentItem> {
        self.repo.get_by_id(id).await.map(Into::into).map_err(not_found)
    }

    async fn due_for_publish(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: u64,
    ) -> PublishResult<Vec<ContentItem>> {
        let items = self.repo.find_due_for_publish(since, until, limit).await?;
        Ok(items.into_iter().map(Into::into).collect())
    }

    async fn due_for_expiry(&self, until: DateTime<Utc>, limit: u64) -> PublishResult<Vec<ContentItem>> {
        let items = self.repo.find_due_for_expiry(until, limit).await?;
        Ok(items.into_iter().map(Into::into).collect())
    }

    async fn set_external_draft(
        &self,
        id: &str,
        expected: Option<&str>,
        draft_id: &str,
    ) -> PublishResult<bool> {
        self.repo
            .set_external_draft(id, expected, draft_id)
            .await
            .map_err(not_found)
    }

    async fn mark_published(
        &self,
        id: &str,
        at: DateTime<Utc>,
        receipt: &PublishReceipt,
    ) -> PublishResult<()> {
        self.repo
            .mark_published(id, at, &receipt.publish_id, receipt.url.as_deref())
            .await
            .map_err(not_found)
    }

    async fn mark_expired(&self, id: &str, at: DateTime<Utc>) -> PublishResult<()> {
        self.repo.mark_expired(id, at).await.map_err(not_found)
    }
}

/// [`AssetStore`] over the `asset` table and the media root.
#[derive(Clone)]
pub struct DbAssetStore {
    repo: AssetRepository,
    files: Arc<dyn FileStore>,
}

impl DbAssetStore {
    /// Create the adapter.
    #[must_use]
    pub fn new(repo: AssetRepository, files: Arc<dyn FileStore>) -> Self {
        Self { repo, files }
    }
}

#[async_trait]
impl AssetStore for DbAssetStore {
    async fn find_by_url(&self, url: &str) -> PublishResult<Option<Asset>> {
        Ok(self.repo.find_by_url(url).await?.map(Into::into))
    }

    async fn find_by_id(&self, id: &str) -> PublishResult<Option<Asset>> {
        Ok(self.repo.find_by_id(id).await?.map(Into::into))
    }

    async fn read(&self, asset: &Asset) -> PublishResult<Bytes> {
        Ok(Bytes::from(self.files.read(&asset.storage_key).await?))
    }

    async fn record_upload(&self, id: &str, uploaded: &UploadedAsset) -> PublishResult<()> {
        self.repo
            .record_upload(id, &uploaded.url, &uploaded.media_id)
            .await
            .map_err(not_found)
    }
}
