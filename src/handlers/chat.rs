//! Chat sessions for the signed-in user.

use axum::{
    Json,
    extract::State,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::extract::{ApiJson, ApiQuery};
use super::{StatusMessage, tenant_db};
use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::models::tenant::{chat_message, chat_room};
use crate::server::AppState;
use crate::services::chat as chat_service;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    #[serde(default = "default_room_name")]
    #[schema(example = "Chat Room")]
    pub room_name: String,
}

fn default_room_name() -> String {
    "Chat Room".to_string()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    pub status: String,
    pub session_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub session_id: Uuid,
    #[schema(example = "経費精算の締め日はいつですか?")]
    pub user_message: String,
    /// Senpai the question is addressed to
    pub senpai_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SendMessageResponse {
    pub status: String,
    pub system_reply: String,
    /// Vector scores of the retrieved documents, in search order
    pub system_score: Vec<f64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EndSessionRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SessionsQuery {
    /// `active` or `ended`
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub room_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<chat_room::Model> for SessionSummary {
    fn from(room: chat_room::Model) -> Self {
        Self {
            session_id: room.id,
            room_name: room.room_name,
            status: room.status,
            created_at: room.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub status: String,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MessagesQuery {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageItem {
    pub message_id: Uuid,
    pub content: String,
    pub is_assistant: bool,
    pub senpai_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<chat_message::Model> for MessageItem {
    fn from(message: chat_message::Model) -> Self {
        Self {
            message_id: message.id,
            content: message.content,
            is_assistant: message.is_assistant,
            senpai_id: message.senpai_id,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageListResponse {
    pub status: String,
    pub session_id: Uuid,
    pub messages: Vec<MessageItem>,
}

#[utoipa::path(
    post,
    path = "/api/v1/chat/sessions",
    request_body = CreateSessionRequest,
    responses((status = 200, description = "Session created", body = CreateSessionResponse)),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    let room = chat_service::create_session(&db, &user, &request.room_name).await?;
    Ok(Json(CreateSessionResponse {
        status: "success".to_string(),
        session_id: room.id,
        message: "Chat session created successfully".to_string(),
    }))
}

/// Answers a user message from the company knowledge base
#[utoipa::path(
    post,
    path = "/api/v1/chat/messages",
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Assistant reply", body = SendMessageResponse),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    let reply = chat_service::send_message(
        &db,
        &state.rag,
        &user,
        request.session_id,
        &request.user_message,
        request.senpai_id,
    )
    .await?;
    Ok(Json(SendMessageResponse {
        status: "success".to_string(),
        system_reply: reply.reply,
        system_score: reply.scores,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/chat/sessions/end",
    request_body = EndSessionRequest,
    responses(
        (status = 200, description = "Session ended", body = StatusMessage),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn end_session(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<EndSessionRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    chat_service::end_session(&db, &user, request.session_id).await?;
    Ok(Json(StatusMessage::success("Chat session ended successfully")))
}

#[utoipa::path(
    get,
    path = "/api/v1/chat/sessions",
    params(SessionsQuery),
    responses((status = 200, description = "The user's sessions", body = SessionListResponse)),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(query): ApiQuery<SessionsQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    let rooms = chat_service::list_sessions(&db, &user, query.status.as_deref()).await?;
    Ok(Json(SessionListResponse {
        status: "success".to_string(),
        sessions: rooms.into_iter().map(SessionSummary::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/chat/messages",
    params(MessagesQuery),
    responses(
        (status = 200, description = "Messages in ascending order", body = MessageListResponse),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(query): ApiQuery<MessagesQuery>,
) -> Result<Json<MessageListResponse>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    let messages = chat_service::list_messages(&db, &user, query.session_id).await?;
    Ok(Json(MessageListResponse {
        status: "success".to_string(),
        session_id: query.session_id,
        messages: messages.into_iter().map(MessageItem::from).collect(),
    }))
}
