//! In-memory fakes for the publisher's ports.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_common::{IdGenerator, LocalStorage};
use herald_publisher::{
    Asset, AssetStore, AssetUpload, ContentItem, ContentPreprocessor, DomainStore, DraftArticle,
    ExternalError, PreprocessConfig, PublishError, PublishReceipt, PublishResult,
    PublishingPlatform, PublishingWorkflow, RemoteAsset, RemoteFetcher, UploadedAsset,
};
use tokio::sync::Mutex;
use url::Url;

pub const PUBLIC_BASE: &str = "https://herald.example.com/media";
pub const PLATFORM_HOST: &str = "mmbiz.platform.example";

pub fn item(id: &str) -> ContentItem {
    ContentItem {
        id: id.to_string(),
        title: "Spring launch".to_string(),
        author: Some("Editorial".to_string()),
        digest: None,
        body: "<p>Hello</p>".to_string(),
        cover_asset_id: None,
        scheduled_at: None,
        expires_at: None,
        external_draft_id: None,
        last_published_at: None,
        expired_at: None,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, ContentItem>>,
}

impl MemoryStore {
    pub async fn insert(&self, item: ContentItem) {
        self.items.lock().await.insert(item.id.clone(), item);
    }

    pub async fn get(&self, id: &str) -> ContentItem {
        self.items.lock().await.get(id).cloned().unwrap()
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn get_item(&self, id: &str) -> PublishResult<ContentItem> {
        self.items
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PublishError::NotFound(id.to_string()))
    }

    async fn due_for_publish(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: u64,
    ) -> PublishResult<Vec<ContentItem>> {
        let items = self.items.lock().await;
        let mut due: Vec<_> = items
            .values()
            .filter(|i| i.expired_at.is_none())
            .filter(|i| i.scheduled_at.is_some_and(|at| at >= since && at <= until))
            .filter(|i| !i.published_since_scheduled())
            .cloned()
            .collect();
        due.sort_by_key(|i| i.scheduled_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn due_for_expiry(&self, until: DateTime<Utc>, limit: u64) -> PublishResult<Vec<ContentItem>> {
        let items = self.items.lock().await;
        let mut due: Vec<_> = items
            .values()
            .filter(|i| i.expired_at.is_none() && i.external_draft_id.is_some())
            .filter(|i| i.expires_at.is_some_and(|at| at <= until))
            .cloned()
            .collect();
        due.sort_by_key(|i| i.expires_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn set_external_draft(
        &self,
        id: &str,
        expected: Option<&str>,
        draft_id: &str,
    ) -> PublishResult<bool> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| PublishError::NotFound(id.to_string()))?;
        if item.external_draft_id.as_deref() != expected {
            return Ok(false);
        }
        item.external_draft_id = Some(draft_id.to_string());
        Ok(true)
    }

    async fn mark_published(
        &self,
        id: &str,
        at: DateTime<Utc>,
        _receipt: &PublishReceipt,
    ) -> PublishResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| PublishError::NotFound(id.to_string()))?;
        item.last_published_at = Some(at);
        Ok(())
    }

    async fn mark_expired(&self, id: &str, at: DateTime<Utc>) -> PublishResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| PublishError::NotFound(id.to_string()))?;
        if item.expired_at.is_some() {
            return Err(PublishError::InvalidState(format!("{id} already expired")));
        }
        item.expired_at = Some(at);
        Ok(())
    }
}

/// Hands out draft IDs `draft-123`, `draft-124`, ... and tracks which are live.
#[derive(Default)]
pub struct FakePlatform {
    pub creates: AtomicU32,
    pub deletes: AtomicU32,
    pub submits: AtomicU32,
    pub uploads: AtomicU32,
    pub fail_deletes: bool,
    pub create_delay: Option<std::time::Duration>,
    pub live_drafts: Mutex<BTreeSet<String>>,
    pub submitted: Mutex<Vec<String>>,
    pub last_articles: Mutex<Vec<DraftArticle>>,
}

impl FakePlatform {
    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishingPlatform for FakePlatform {
    async fn create_draft(&self, articles: &[DraftArticle]) -> PublishResult<String> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let draft_id = format!("draft-{}", 123 + n);
        self.live_drafts.lock().await.insert(draft_id.clone());
        *self.last_articles.lock().await = articles.to_vec();
        Ok(draft_id)
    }

    async fn delete_draft(&self, draft_id: &str) -> PublishResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes {
            return Err(ExternalError::new(40007, "invalid media_id").into());
        }
        self.live_drafts.lock().await.remove(draft_id);
        Ok(())
    }

    async fn submit_publish(&self, draft_id: &str) -> PublishResult<PublishReceipt> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().await.push(draft_id.to_string());
        Ok(PublishReceipt {
            publish_id: format!("pub-{draft_id}"),
            url: Some(format!("https://{PLATFORM_HOST}/s/{draft_id}")),
        })
    }

    async fn upload_asset(&self, upload: AssetUpload) -> PublishResult<UploadedAsset> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(UploadedAsset {
            url: format!("https://{PLATFORM_HOST}/img/{n}/{}", upload.file_name),
            media_id: format!("media-{n}"),
        })
    }
}

#[derive(Default)]
pub struct MemoryAssets {
    assets: Mutex<HashMap<String, Asset>>,
    pub recorded: AtomicU32,
}

impl MemoryAssets {
    pub async fn insert_local(&self, id: &str, file_name: &str) -> Asset {
        let asset = Asset {
            id: id.to_string(),
            storage_key: format!("2026/10/{file_name}"),
            url: format!("{PUBLIC_BASE}/2026/10/{file_name}"),
            content_type: "image/png".to_string(),
            platform_url: None,
            platform_media_id: None,
        };
        self.assets.lock().await.insert(id.to_string(), asset.clone());
        asset
    }

    pub async fn get(&self, id: &str) -> Asset {
        self.assets.lock().await.get(id).cloned().unwrap()
    }
}

#[async_trait]
impl AssetStore for MemoryAssets {
    async fn find_by_url(&self, url: &str) -> PublishResult<Option<Asset>> {
        Ok(self
            .assets
            .lock()
            .await
            .values()
            .find(|a| a.url == url)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> PublishResult<Option<Asset>> {
        Ok(self.assets.lock().await.get(id).cloned())
    }

    async fn read(&self, _asset: &Asset) -> PublishResult<Bytes> {
        Ok(Bytes::from_static(b"\x89PNG"))
    }

    async fn record_upload(&self, id: &str, uploaded: &UploadedAsset) -> PublishResult<()> {
        self.recorded.fetch_add(1, Ordering::SeqCst);
        let mut assets = self.assets.lock().await;
        let asset = assets
            .get_mut(id)
            .ok_or_else(|| PublishError::NotFound(id.to_string()))?;
        asset.platform_url = Some(uploaded.url.clone());
        asset.platform_media_id = Some(uploaded.media_id.clone());
        Ok(())
    }
}

/// Serves a tiny image for every host except `broken.example`.
#[derive(Default)]
pub struct FakeFetcher {
    pub fetches: AtomicU32,
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> PublishResult<RemoteAsset> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if url.host_str() == Some("broken.example") {
            return Err(PublishError::Store(herald_common::AppError::ExternalService(
                "HTTP 404".to_string(),
            )));
        }
        Ok(RemoteAsset {
            content_type: "image/jpeg".to_string(),
            bytes: Bytes::from_static(b"\xff\xd8\xff"),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub platform: Arc<FakePlatform>,
    pub assets: Arc<MemoryAssets>,
    pub fetcher: Arc<FakeFetcher>,
    pub scratch: LocalStorage,
    pub preprocessor: Arc<ContentPreprocessor>,
    pub workflow: Arc<PublishingWorkflow>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_platform(FakePlatform::default())
    }

    pub fn with_platform(platform: FakePlatform) -> Self {
        let store = Arc::new(MemoryStore::default());
        let platform = Arc::new(platform);
        let assets = Arc::new(MemoryAssets::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let scratch = LocalStorage::new(
            std::env::temp_dir().join(format!("herald-scratch-{}", IdGenerator::new().generate())),
        );

        let preprocessor = Arc::new(ContentPreprocessor::new(
            platform.clone(),
            assets.clone(),
            fetcher.clone(),
            Arc::new(scratch.clone()),
            PreprocessConfig {
                public_base_url: PUBLIC_BASE.to_string(),
                media_hosts: vec![PLATFORM_HOST.to_string()],
            },
        ));
        let workflow = Arc::new(PublishingWorkflow::new(
            store.clone(),
            platform.clone(),
            preprocessor.clone(),
        ));

        Self {
            store,
            platform,
            assets,
            fetcher,
            scratch,
            preprocessor,
            workflow,
        }
    }
}
