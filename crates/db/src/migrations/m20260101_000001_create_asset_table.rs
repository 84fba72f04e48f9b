//! Create `asset` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Asset::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Asset::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Asset::StorageKey).string_len(512).not_null())
                    .col(
                        ColumnDef::new(Asset::Url)
                            .string_len(1024)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Asset::ContentType).string_len(128).not_null())
                    .col(ColumnDef::new(Asset::Size).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Asset::PlatformUrl).string_len(1024))
                    .col(ColumnDef::new(Asset::PlatformMediaId).string_len(128))
                    .col(ColumnDef::new(Asset::UploadedAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Asset::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Asset::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Asset {
    Table,
    Id,
    StorageKey,
    Url,
    ContentType,
    Size,
    PlatformUrl,
    PlatformMediaId,
    UploadedAt,
    CreatedAt,
}
