//! Content item entity (articles staged for external publication).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Publication state of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ContentStatus {
    /// No external draft yet.
    #[sea_orm(string_value = "draft")]
    Draft,
    /// An external draft exists.
    #[sea_orm(string_value = "draft_created")]
    DraftCreated,
    /// The latest draft was submitted for publication.
    #[sea_orm(string_value = "published")]
    Published,
    /// Past its expiry time. Terminal.
    #[sea_orm(string_value = "expired")]
    Expired,
}

/// A content item that may be published to the external platform.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_item")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Article title.
    pub title: String,

    /// Author shown on the platform.
    #[sea_orm(nullable)]
    pub author: Option<String>,

    /// Short summary.
    #[sea_orm(nullable)]
    pub digest: Option<String>,

    /// HTML body.
    #[sea_orm(column_type = "Text")]
    pub body: String,

    /// Cover image asset.
    #[sea_orm(nullable)]
    pub cover_asset_id: Option<String>,

    /// Current publication state.
    pub status: ContentStatus,

    /// When the item should go live.
    #[sea_orm(indexed, nullable)]
    pub scheduled_at: Option<DateTimeWithTimeZone>,

    /// When the item stops being live.
    #[sea_orm(indexed, nullable)]
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Draft ID on the external platform.
    #[sea_orm(nullable)]
    pub external_draft_id: Option<String>,

    /// Publish job ID returned by the external platform.
    #[sea_orm(nullable)]
    pub external_publish_id: Option<String>,

    /// Public URL of the published article.
    #[sea_orm(nullable)]
    pub published_url: Option<String>,

    /// When the item was last submitted for publication.
    #[sea_orm(nullable)]
    pub last_published_at: Option<DateTimeWithTimeZone>,

    /// When the item was marked expired.
    #[sea_orm(nullable)]
    pub expired_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::asset::Entity",
        from = "Column::CoverAssetId",
        to = "super::asset::Column::Id",
        on_delete = "SetNull"
    )]
    CoverAsset,
}

impl Related<super::asset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CoverAsset.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
