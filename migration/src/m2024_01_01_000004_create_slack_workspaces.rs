use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SlackWorkspaces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SlackWorkspaces::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SlackWorkspaces::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(SlackWorkspaces::TeamId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(SlackWorkspaces::BotUserId).string().null())
                    .col(ColumnDef::new(SlackWorkspaces::Scopes).json().not_null())
                    .col(
                        ColumnDef::new(SlackWorkspaces::InstalledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SlackWorkspaces::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SlackWorkspaces::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SlackWorkspaces::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_slack_workspaces_tenant_id")
                    .table(SlackWorkspaces::Table)
                    .col(SlackWorkspaces::TenantId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SlackWorkspaces::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SlackWorkspaces {
    Table,
    Id,
    TenantId,
    TeamId,
    BotUserId,
    Scopes,
    InstalledAt,
    LastSyncAt,
    CreatedAt,
    UpdatedAt,
}
