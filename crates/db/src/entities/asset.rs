//! Asset entity (locally hosted media referenced from content bodies).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "asset")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Key under the media root
    pub storage_key: String,

    /// Public URL under which the asset is served locally
    #[sea_orm(unique)]
    pub url: String,

    /// MIME type
    pub content_type: String,

    /// File size in bytes
    pub size: i64,

    /// URL of the copy hosted by the external platform
    #[sea_orm(nullable)]
    pub platform_url: Option<String>,

    /// Media ID assigned by the external platform
    #[sea_orm(nullable)]
    pub platform_media_id: Option<String>,

    #[sea_orm(nullable)]
    pub uploaded_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
