use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Senpais::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Senpais::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Senpais::CompanyId).uuid().not_null())
                    .col(ColumnDef::new(Senpais::Name).string().not_null())
                    .col(ColumnDef::new(Senpais::Profile).json().not_null())
                    .col(
                        ColumnDef::new(Senpais::CreatedAt)
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
            .drop_table(Table::drop().table(Senpais::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Senpais {
    Table,
    Id,
    CompanyId,
    Name,
    Profile,
    CreatedAt,
}
