//! Create `content_item` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ContentItem::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ContentItem::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ContentItem::Title).string_len(256).not_null())
                    .col(ColumnDef::new(ContentItem::Author).string_len(64))
                    .col(ColumnDef::new(ContentItem::Digest).string_len(512))
                    .col(ColumnDef::new(ContentItem::Body).text().not_null())
                    .col(ColumnDef::new(ContentItem::CoverAssetId).string_len(32))
                    .col(
                        ColumnDef::new(ContentItem::Status)
                            .string_len(16)
                            .not_null()
                            .default("draft"),
                    )
                    .col(ColumnDef::new(ContentItem::ScheduledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(ContentItem::ExpiresAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(ContentItem::ExternalDraftId).string_len(128))
                    .col(ColumnDef::new(ContentItem::ExternalPublishId).string_len(128))
                    .col(ColumnDef::new(ContentItem::PublishedUrl).string_len(1024))
                    .col(ColumnDef::new(ContentItem::LastPublishedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(ContentItem::ExpiredAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(ContentItem::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(ContentItem::UpdatedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_content_item_cover_asset")
                            .from(ContentItem::Table, ContentItem::CoverAssetId)
                            .to(Asset::Table, Asset::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Composite index for the scheduled-publish scan
        manager
            .create_index(
                Index::create()
                    .name("idx_content_item_status_scheduled_at")
                    .table(ContentItem::Table)
                    .col(ContentItem::Status)
                    .col(ContentItem::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        // Composite index for the expiry scan
        manager
            .create_index(
                Index::create()
                    .name("idx_content_item_status_expires_at")
                    .table(ContentItem::Table)
                    .col(ContentItem::Status)
                    .col(ContentItem::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ContentItem::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum ContentItem {
    Table,
    Id,
    Title,
    Author,
    Digest,
    Body,
    CoverAssetId,
    Status,
    ScheduledAt,
    ExpiresAt,
    ExternalDraftId,
    ExternalPublishId,
    PublishedUrl,
    LastPublishedAt,
    ExpiredAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Asset {
    Table,
    Id,
}
