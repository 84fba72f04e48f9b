//! Content item repository.

use std::sync::Arc;

use crate::entities::content_item::{self, ContentStatus};
use crate::entities::ContentItem;
use chrono::{DateTime, Utc};
use herald_common::{AppError, AppResult};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};

/// Content item repository for database operations.
#[derive(Clone)]
pub struct ContentItemRepository {
    db: Arc<DatabaseConnection>,
}

impl ContentItemRepository {
    /// Create a new content item repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a content item by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<content_item::Model>> {
        ContentItem::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get a content item by ID, returning an error if not found.
    pub async fn get_by_id(&self, id: &str) -> AppResult<content_item::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Content item {id} not found")))
    }

    /// Find items scheduled within `since..=until` that have not been
    /// published since they were scheduled.
    ///
    /// Items scheduled before `since` are left to manual intervention.
    pub async fn find_due_for_publish(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<content_item::Model>> {
        ContentItem::find()
            .filter(content_item::Column::Status.ne(ContentStatus::Expired))
            .filter(content_item::Column::ScheduledAt.is_not_null())
            .filter(content_item::Column::ScheduledAt.gte(since))
            .filter(content_item::Column::ScheduledAt.lte(until))
            .filter(
                Condition::any()
                    .add(content_item::Column::LastPublishedAt.is_null())
                    .add(
                        Expr::col(content_item::Column::LastPublishedAt)
                            .lt(Expr::col(content_item::Column::ScheduledAt)),
                    ),
            )
            .order_by_asc(content_item::Column::ScheduledAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find live items whose expiry falls on or before `until`.
    pub async fn find_due_for_expiry(
        &self,
        until: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<content_item::Model>> {
        ContentItem::find()
            .filter(content_item::Column::Status.ne(ContentStatus::Expired))
            .filter(content_item::Column::ExternalDraftId.is_not_null())
            .filter(content_item::Column::ExpiresAt.is_not_null())
            .filter(content_item::Column::ExpiresAt.lte(until))
            .order_by_asc(content_item::Column::ExpiresAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Swap the external draft ID from `expected` to `draft_id`.
    ///
    /// Returns `false` when the stored draft is no longer `expected`, meaning
    /// another run staged its own draft first.
    pub async fn set_external_draft(
        &self,
        id: &str,
        expected: Option<&str>,
        draft_id: &str,
    ) -> AppResult<bool> {
        let current = match expected {
            Some(expected) => Condition::all().add(content_item::Column::ExternalDraftId.eq(expected)),
            None => Condition::any()
                .add(content_item::Column::ExternalDraftId.is_null())
                .add(content_item::Column::ExternalDraftId.eq("")),
        };

        let result = ContentItem::update_many()
            .col_expr(
                content_item::Column::ExternalDraftId,
                Expr::value(draft_id.to_string()),
            )
            .col_expr(
                content_item::Column::Status,
                Expr::value(ContentStatus::DraftCreated),
            )
            .col_expr(content_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(content_item::Column::Id.eq(id))
            .filter(content_item::Column::Status.ne(ContentStatus::Expired))
            .filter(current)
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected > 0 {
            return Ok(true);
        }
        match self.find_by_id(id).await? {
            None => Err(AppError::NotFound(format!("Content item {id} not found"))),
            Some(item) if item.status == ContentStatus::Expired => Err(AppError::Conflict(
                format!("Content item {id} is already expired"),
            )),
            Some(_) => Ok(false),
        }
    }

    /// Record a successful publish submission.
    pub async fn mark_published(
        &self,
        id: &str,
        published_at: DateTime<Utc>,
        publish_id: &str,
        url: Option<&str>,
    ) -> AppResult<()> {
        let result = ContentItem::update_many()
            .col_expr(
                content_item::Column::Status,
                Expr::value(ContentStatus::Published),
            )
            .col_expr(
                content_item::Column::LastPublishedAt,
                Expr::value(published_at),
            )
            .col_expr(
                content_item::Column::ExternalPublishId,
                Expr::value(publish_id.to_string()),
            )
            .col_expr(
                content_item::Column::PublishedUrl,
                Expr::value(url.map(ToString::to_string)),
            )
            .col_expr(content_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(content_item::Column::Id.eq(id))
            .filter(content_item::Column::Status.ne(ContentStatus::Expired))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected == 0 {
            return Err(self.missing_or_expired(id).await);
        }
        Ok(())
    }

    /// Mark an item as expired.
    pub async fn mark_expired(&self, id: &str, expired_at: DateTime<Utc>) -> AppResult<()> {
        let result = ContentItem::update_many()
            .col_expr(
                content_item::Column::Status,
                Expr::value(ContentStatus::Expired),
            )
            .col_expr(content_item::Column::ExpiredAt, Expr::value(expired_at))
            .col_expr(content_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(content_item::Column::Id.eq(id))
            .filter(content_item::Column::Status.ne(ContentStatus::Expired))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected == 0 {
            return Err(self.missing_or_expired(id).await);
        }
        Ok(())
    }

    async fn missing_or_expired(&self, id: &str) -> AppError {
        match self.find_by_id(id).await {
            Ok(Some(_)) => AppError::Conflict(format!("Content item {id} is already expired")),
            Ok(None) => AppError::NotFound(format!("Content item {id} not found")),
            Err(e) => e,
        }
    }
}
