//! Asset repository.

use std::sync::Arc;

use crate::entities::{Asset, asset};
use chrono::Utc;
use herald_common::{AppError, AppResult};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

/// Asset repository for database operations.
#[derive(Clone)]
pub struct AssetRepository {
    db: Arc<DatabaseConnection>,
}

impl AssetRepository {
    /// Create a new asset repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an asset by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<asset::Model>> {
        Asset::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find an asset by its local public URL.
    pub async fn find_by_url(&self, url: &str) -> AppResult<Option<asset::Model>> {
        Asset::find()
            .filter(asset::Column::Url.eq(url))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Store the platform-hosted copy of an asset.
    pub async fn record_upload(&self, id: &str, platform_url: &str, media_id: &str) -> AppResult<()> {
        let result = Asset::update_many()
            .col_expr(
                asset::Column::PlatformUrl,
                Expr::value(platform_url.to_string()),
            )
            .col_expr(
                asset::Column::PlatformMediaId,
                Expr::value(media_id.to_string()),
            )
            .col_expr(asset::Column::UploadedAt, Expr::value(Utc::now()))
            .filter(asset::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Asset {id} not found")));
        }
        Ok(())
    }
}
