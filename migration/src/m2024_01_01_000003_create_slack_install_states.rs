//! Short-lived OAuth `state` values issued by the Slack authorize-url endpoint.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SlackInstallStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SlackInstallStates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SlackInstallStates::CompanyId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SlackInstallStates::State)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(SlackInstallStates::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SlackInstallStates::CreatedAt)
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
                    .name("idx_slack_install_states_expires_at")
                    .table(SlackInstallStates::Table)
                    .col(SlackInstallStates::ExpiresAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SlackInstallStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SlackInstallStates {
    Table,
    Id,
    CompanyId,
    State,
    ExpiresAt,
    CreatedAt,
}
