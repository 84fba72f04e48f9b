//! The publish/expire state machine for content items.
//!
//! `Draft` → `DraftCreated` → `Published` → `Expired`. Publishing again from
//! any state but `Expired` deletes the previous draft first.
//!
//! The new draft ID is persisted before submission so a crash between the two
//! steps leaves the linkage in place; the next attempt deletes that draft and
//! stages a fresh one.
//!
//! The draft ID is swapped only if it still holds the value this run read.
//! When two runs race, the loser deletes its own draft and never submits.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::{DraftArticle, PublishingPlatform};
use crate::error::{PublishError, PublishResult};
use crate::preprocess::ContentPreprocessor;
use crate::store::{ContentItem, DomainStore, ItemState};

/// What a publish run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Content item ID.
    pub item_id: String,
    /// Draft staged by this run.
    pub draft_id: String,
    /// Platform publish ID.
    pub publish_id: String,
    /// Public URL, when the platform returns one.
    pub url: Option<String>,
    /// Draft staged by an earlier run, if any.
    pub replaced_draft: Option<String>,
    /// Asset references rewritten by the preprocessor.
    pub rewritten_assets: usize,
}

/// Orchestrates preprocessing, drafting, submission and persistence.
pub struct PublishingWorkflow {
    store: Arc<dyn DomainStore>,
    platform: Arc<dyn PublishingPlatform>,
    preprocessor: Arc<ContentPreprocessor>,
}

impl PublishingWorkflow {
    /// Create a workflow.
    pub fn new(
        store: Arc<dyn DomainStore>,
        platform: Arc<dyn PublishingPlatform>,
        preprocessor: Arc<ContentPreprocessor>,
    ) -> Self {
        Self {
            store,
            platform,
            preprocessor,
        }
    }

    /// Load an item.
    pub async fn item(&self, item_id: &str) -> PublishResult<ContentItem> {
        self.store.get_item(item_id).await
    }

    /// Publish an item, replacing any draft staged by an earlier run.
    #[tracing::instrument(skip(self), fields(item_id = %item_id))]
    pub async fn publish(&self, item_id: &str) -> PublishResult<PublishReport> {
        let item = self.store.get_item(item_id).await?;
        if item.state() == ItemState::Expired {
            return Err(PublishError::InvalidState(format!(
                "content item {item_id} is expired"
            )));
        }

        let processed = self.preprocessor.process(&item.body).await;
        let thumb_media_id = match &item.cover_asset_id {
            Some(asset_id) => match self.preprocessor.media_id_for(asset_id).await {
                Ok(media_id) => Some(media_id),
                Err(e) => {
                    tracing::warn!(asset_id = %asset_id, error = %e, "Cover upload failed, publishing without cover");
                    None
                }
            },
            None => None,
        };

        // Best-effort: the draft may already be gone on the platform side
        if let Some(stale) = &item.external_draft_id {
            match self.platform.delete_draft(stale).await {
                Ok(()) => tracing::debug!(draft_id = %stale, "Stale draft deleted"),
                Err(e) => {
                    tracing::warn!(draft_id = %stale, error = %e, "Failed to delete stale draft, continuing");
                }
            }
        }

        let article = DraftArticle {
            title: item.title.clone(),
            author: item.author.clone(),
            digest: item.digest.clone(),
            content: processed.body,
            thumb_media_id,
        };
        let draft_id = self.platform.create_draft(&[article]).await?;
        let swapped = self
            .store
            .set_external_draft(&item.id, item.external_draft_id.as_deref(), &draft_id)
            .await?;
        if !swapped {
            self.withdraw(&draft_id).await;
            return Err(PublishError::Superseded(item.id));
        }

        let receipt = self.platform.submit_publish(&draft_id).await?;
        self.store
            .mark_published(&item.id, Utc::now(), &receipt)
            .await?;

        tracing::info!(
            draft_id = %draft_id,
            publish_id = %receipt.publish_id,
            assets = processed.replaced.len(),
            "Content item published"
        );

        Ok(PublishReport {
            item_id: item.id,
            draft_id,
            publish_id: receipt.publish_id,
            url: receipt.url,
            replaced_draft: item.external_draft_id,
            rewritten_assets: processed.replaced.len(),
        })
    }

    async fn withdraw(&self, draft_id: &str) {
        match self.platform.delete_draft(draft_id).await {
            Ok(()) => tracing::info!(draft_id = %draft_id, "Concurrent run won, own draft withdrawn"),
            Err(e) => {
                tracing::warn!(draft_id = %draft_id, error = %e, "Concurrent run won, failed to withdraw own draft");
            }
        }
    }

    /// Mark an item expired once its expiry time has passed.
    ///
    /// Content already live on the platform stays there.
    #[tracing::instrument(skip(self), fields(item_id = %item_id))]
    pub async fn expire(&self, item_id: &str, now: DateTime<Utc>) -> PublishResult<()> {
        let item = self.store.get_item(item_id).await?;
        check_expirable(&item, now)?;

        self.store.mark_expired(&item.id, now).await?;
        tracing::info!(
            draft_id = ?item.external_draft_id,
            "Content item expired; published platform content is not retracted"
        );
        Ok(())
    }
}

fn check_expirable(item: &ContentItem, now: DateTime<Utc>) -> PublishResult<()> {
    if item.state() == ItemState::Expired {
        return Err(PublishError::InvalidState(format!(
            "content item {} is already expired",
            item.id
        )));
    }
    let Some(expires_at) = item.expires_at else {
        return Err(PublishError::InvalidState(format!(
            "content item {} has no expiry time",
            item.id
        )));
    };
    if now < expires_at {
        return Err(PublishError::InvalidState(format!(
            "content item {} expires at {expires_at}",
            item.id
        )));
    }
    if item.external_draft_id.is_none() {
        return Err(PublishError::InvalidState(format!(
            "content item {} was never staged",
            item.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn item(now: DateTime<Utc>) -> ContentItem {
        ContentItem {
            id: "item1".to_string(),
            title: "Launch".to_string(),
            author: None,
            digest: None,
            body: String::new(),
            cover_asset_id: None,
            scheduled_at: None,
            expires_at: Some(now),
            external_draft_id: Some("draft-123".to_string()),
            last_published_at: Some(now - Duration::days(1)),
            expired_at: None,
        }
    }

    #[test]
    fn test_expirable_once_due() {
        let now = Utc::now();
        assert!(check_expirable(&item(now), now).is_ok());
        assert!(check_expirable(&item(now), now - Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_expire_requires_draft() {
        let now = Utc::now();
        let mut item = item(now);
        item.external_draft_id = None;
        assert!(matches!(
            check_expirable(&item, now),
            Err(PublishError::InvalidState(_))
        ));
    }

    #[test]
    fn test_expire_is_terminal() {
        let now = Utc::now();
        let mut item = item(now);
        item.expired_at = Some(now);
        assert!(check_expirable(&item, now).is_err());

        item.expired_at = None;
        item.expires_at = None;
        assert!(check_expirable(&item, now).is_err());
    }
}
