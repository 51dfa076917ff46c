//! # Chat Repository
//!
//! Chat rooms and their messages in the tenant database.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    Unchanged,
};
use serde_json::Value;
use uuid::Uuid;

use crate::models::tenant::chat_room::{STATUS_ACTIVE, STATUS_ENDED};
use crate::models::tenant::{chat_message, chat_room};

/// A message to append to a room
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: Uuid,
    pub is_assistant: bool,
    pub senpai_id: Option<Uuid>,
    pub content: String,
    pub metadata: Option<Value>,
}

pub struct ChatRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> ChatRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Open an active room owned by `owner_id`
    pub async fn create_room(
        &self,
        company_id: Uuid,
        owner_id: Uuid,
        room_name: &str,
    ) -> Result<chat_room::Model, sea_orm::DbErr> {
        let model = chat_room::Model {
            id: Uuid::new_v4(),
            company_id,
            owner_id,
            room_name: room_name.to_string(),
            status: STATUS_ACTIVE.to_string(),
            created_at: Utc::now(),
        };
        chat_room::Entity::insert(chat_room::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find_room(&self, id: Uuid) -> Result<Option<chat_room::Model>, sea_orm::DbErr> {
        chat_room::Entity::find_by_id(id).one(self.db).await
    }

    pub async fn end_room(&self, id: Uuid) -> Result<chat_room::Model, sea_orm::DbErr> {
        chat_room::ActiveModel {
            id: Unchanged(id),
            status: Set(STATUS_ENDED.to_string()),
            ..Default::default()
        }
        .update(self.db)
        .await
    }

    /// Rooms owned by the user, newest first, optionally filtered by status
    pub async fn list_rooms(
        &self,
        owner_id: Uuid,
        status: Option<&str>,
    ) -> Result<Vec<chat_room::Model>, sea_orm::DbErr> {
        let mut query = chat_room::Entity::find().filter(chat_room::Column::OwnerId.eq(owner_id));
        if let Some(status) = status {
            query = query.filter(chat_room::Column::Status.eq(status));
        }
        query
            .order_by_desc(chat_room::Column::CreatedAt)
            .all(self.db)
            .await
    }

    pub async fn add_message(
        &self,
        message: NewMessage,
    ) -> Result<chat_message::Model, sea_orm::DbErr> {
        let model = chat_message::Model {
            id: Uuid::new_v4(),
            room_id: message.room_id,
            is_assistant: message.is_assistant,
            senpai_id: message.senpai_id,
            content: message.content,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        chat_message::Entity::insert(chat_message::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    /// Messages in a room, oldest first
    pub async fn list_messages(
        &self,
        room_id: Uuid,
    ) -> Result<Vec<chat_message::Model>, sea_orm::DbErr> {
        chat_message::Entity::find()
            .filter(chat_message::Column::RoomId.eq(room_id))
            .order_by_asc(chat_message::Column::CreatedAt)
            .all(self.db)
            .await
    }
}
