//! Uploaded CSV sources feeding the per-company search index.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CsvFiles::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(CsvFiles::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(CsvFiles::FileName).string().not_null())
                    .col(ColumnDef::new(CsvFiles::Size).big_integer().not_null())
                    .col(
                        ColumnDef::new(CsvFiles::UploadedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(CsvFiles::BlobUrl).text().not_null())
                    .col(
                        ColumnDef::new(CsvFiles::Status)
                            .string()
                            .not_null()
                            .default("uploaded"),
                    )
                    .col(ColumnDef::new(CsvFiles::CompanyId).uuid().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CsvFiles::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CsvFiles {
    Table,
    Id,
    FileName,
    Size,
    UploadedAt,
    BlobUrl,
    Status,
    CompanyId,
}
