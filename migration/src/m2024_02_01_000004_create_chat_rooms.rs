use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ChatRooms::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ChatRooms::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(ChatRooms::CompanyId).uuid().not_null())
                    .col(ColumnDef::new(ChatRooms::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(ChatRooms::RoomName).string().not_null())
                    .col(
                        ColumnDef::new(ChatRooms::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ChatRooms::CreatedAt)
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
                    .name("idx_chat_rooms_owner_status")
                    .table(ChatRooms::Table)
                    .col(ChatRooms::OwnerId)
                    .col(ChatRooms::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChatRooms::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum ChatRooms {
    Table,
    Id,
    CompanyId,
    OwnerId,
    RoomName,
    Status,
    CreatedAt,
}
