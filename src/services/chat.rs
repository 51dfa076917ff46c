//! Chat rooms whose assistant replies come from the company knowledge base.

use sea_orm::DatabaseConnection;
use serde_json::json;
use uuid::Uuid;

use super::rag::{RagAnswer, RagService};
use crate::auth::CurrentUser;
use crate::error::{ApiError, not_found};
use crate::models::tenant::{chat_message, chat_room};
use crate::repositories::{ChatRepository, NewMessage, SenpaiRepository};

pub const CHAT_TOP_K: usize = 10;

/// Assistant reply stored for a user message.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub reply: String,
    pub scores: Vec<f64>,
}

/// Query sent to retrieval, addressed to a senpai when one is named.
pub fn senpai_query(senpai_name: Option<&str>, message: &str) -> String {
    match senpai_name {
        Some(name) => format!("{}について教えて: {}", name, message),
        None => message.to_string(),
    }
}

async fn owned_room(
    db: &DatabaseConnection,
    user: &CurrentUser,
    room_id: Uuid,
) -> Result<chat_room::Model, ApiError> {
    ChatRepository::new(db)
        .find_room(room_id)
        .await?
        .filter(|room| room.company_id == user.company_id)
        .ok_or_else(|| {
            not_found("Chat session not found").with_details(json!({ "session_id": room_id }))
        })
}

pub async fn create_session(
    db: &DatabaseConnection,
    user: &CurrentUser,
    room_name: &str,
) -> Result<chat_room::Model, ApiError> {
    let room = ChatRepository::new(db)
        .create_room(user.company_id, user.user_id, room_name)
        .await?;
    tracing::info!(session_id = %room.id, user_id = %user.user_id, "Chat session created");
    Ok(room)
}

/// Stores the user message, answers it through retrieval and stores the reply.
pub async fn send_message(
    db: &DatabaseConnection,
    rag: &RagService,
    user: &CurrentUser,
    room_id: Uuid,
    message: &str,
    senpai_id: Option<Uuid>,
) -> Result<ChatReply, ApiError> {
    let room = owned_room(db, user, room_id).await?;
    let chats = ChatRepository::new(db);
    chats
        .add_message(NewMessage {
            room_id: room.id,
            is_assistant: false,
            senpai_id: None,
            content: message.to_string(),
            metadata: Some(json!({})),
        })
        .await?;

    let senpai = match senpai_id {
        Some(id) => SenpaiRepository::new(db).find(id).await?,
        None => None,
    };
    let query = senpai_query(senpai.as_ref().map(|s| s.name.as_str()), message);

    let RagAnswer { answer, scores, .. } = rag
        .query_index(db, user.company_id, &query, CHAT_TOP_K)
        .await?;

    chats
        .add_message(NewMessage {
            room_id: room.id,
            is_assistant: true,
            senpai_id,
            content: answer.clone(),
            metadata: Some(json!({})),
        })
        .await?;

    Ok(ChatReply {
        reply: answer,
        scores,
    })
}

pub async fn end_session(
    db: &DatabaseConnection,
    user: &CurrentUser,
    room_id: Uuid,
) -> Result<(), ApiError> {
    let room = owned_room(db, user, room_id).await?;
    ChatRepository::new(db).end_room(room.id).await?;
    tracing::info!(session_id = %room_id, "Chat session ended");
    Ok(())
}

pub async fn list_sessions(
    db: &DatabaseConnection,
    user: &CurrentUser,
    status: Option<&str>,
) -> Result<Vec<chat_room::Model>, ApiError> {
    Ok(ChatRepository::new(db)
        .list_rooms(user.user_id, status)
        .await?
        .into_iter()
        .filter(|room| room.company_id == user.company_id)
        .collect())
}

pub async fn list_messages(
    db: &DatabaseConnection,
    user: &CurrentUser,
    room_id: Uuid,
) -> Result<Vec<chat_message::Model>, ApiError> {
    owned_room(db, user, room_id).await?;
    Ok(ChatRepository::new(db).list_messages(room_id).await?)
}
