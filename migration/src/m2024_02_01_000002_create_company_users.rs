use sea_orm_migration::prelude::*;

use crate::m2024_02_01_000001_create_companies::Companies;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CompanyUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CompanyUsers::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CompanyUsers::CompanyId).uuid().not_null())
                    .col(ColumnDef::new(CompanyUsers::Email).string().not_null())
                    .col(ColumnDef::new(CompanyUsers::Name).string().not_null())
                    .col(ColumnDef::new(CompanyUsers::Role).string().not_null())
                    .col(
                        ColumnDef::new(CompanyUsers::AzureUserId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(CompanyUsers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_company_users_company_id")
                            .from(CompanyUsers::Table, CompanyUsers::CompanyId)
                            .to(Companies::Table, Companies::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CompanyUsers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CompanyUsers {
    Table,
    Id,
    CompanyId,
    Email,
    Name,
    Role,
    AzureUserId,
    CreatedAt,
}
