//! Slack Events API, interactivity, slash commands, collection and OAuth install.
//!
//! `/events`, `/interactivity` and `/commands` sit behind the signing-secret
//! middleware and acknowledge immediately; the work runs on spawned tasks.

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::extract::{ApiJson, ApiQuery};
use crate::error::{ApiError, ErrorCode, invalid_request};
use crate::server::AppState;
use crate::services::slack::{
    API_FETCH_DAYS, EventEnvelope, SlashCommand, fetch_error_text, parse_interaction,
};

static RETRY_NUM_HEADER: HeaderName = HeaderName::from_static("x-slack-retry-num");
static NO_RETRY_HEADER: HeaderName = HeaderName::from_static("x-slack-no-retry");

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SlackAck {
    pub ok: bool,
}

fn ack() -> Json<SlackAck> {
    Json(SlackAck { ok: true })
}

#[derive(Debug, Deserialize)]
pub struct InteractivityForm {
    pub payload: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandAck {
    /// Always `ephemeral`
    pub response_type: String,
    pub text: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    #[schema(example = "T0123456")]
    pub team_id: String,
    pub company_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: String,
    pub messages: usize,
    pub channels: usize,
    /// Stored CSV, absent when nothing was collected
    pub file_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuthorizeQuery {
    pub company_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeUrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct InstallQuery {
    pub code: String,
    /// `{nonce}_{company_id}` issued by the authorize-url endpoint
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstallResponse {
    pub status: String,
    pub team_id: String,
    pub message: String,
}

/// Events API callback
#[utoipa::path(
    post,
    path = "/api/v1/slack/events",
    request_body(content = Object, description = "Events API envelope"),
    responses(
        (status = 200, description = "Challenge echo or acknowledgement"),
        (status = 401, description = "Invalid request signature", body = ApiError)
    ),
    tag = "slack"
)]
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(envelope): ApiJson<EventEnvelope>,
) -> Json<Value> {
    if let Some(challenge) = envelope.challenge.as_deref() {
        tracing::info!("Handling URL verification challenge");
        return Json(json!({ "challenge": challenge }));
    }
    if headers.contains_key(&RETRY_NUM_HEADER) {
        tracing::info!("Received retry request, returning early");
        return Json(json!({ "ok": true }));
    }
    if let Some(event_id) = envelope.event_id.as_deref() {
        if state.slack.is_duplicate_event(event_id).await {
            tracing::info!(event_id, "Duplicate event detected");
            return Json(json!({ "ok": true }));
        }
    }

    state.slack.dispatch_event(envelope);
    Json(json!({ "ok": true }))
}

/// Block action callback for the senpai select menu
#[utoipa::path(
    post,
    path = "/api/v1/slack/interactivity",
    request_body(content_type = "application/x-www-form-urlencoded", description = "Form with a JSON `payload` field"),
    responses(
        (status = 200, description = "Accepted; the answer is posted asynchronously", body = SlackAck),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 404, description = "Unknown workspace", body = ApiError)
    ),
    tag = "slack"
)]
pub async fn interactivity(
    State(state): State<AppState>,
    Form(form): Form<InteractivityForm>,
) -> Result<Response, ApiError> {
    let raw = form
        .payload
        .ok_or_else(|| invalid_request("payload not found"))?;
    let selection = parse_interaction(&raw)?;
    let company_id = state.slack.workspace(&selection.team_id).await?.tenant_id;
    tracing::info!(team_id = %selection.team_id, senpai = %selection.senpai, "Senpai selected");

    let slack = Arc::clone(&state.slack);
    tokio::spawn(async move {
        if let Err(e) = slack.answer_selection(&selection, company_id).await {
            tracing::error!(team_id = %selection.team_id, error = %e, "Error in background processing");
        }
    });

    let mut response = ack().into_response();
    response
        .headers_mut()
        .insert(NO_RETRY_HEADER.clone(), HeaderValue::from_static("1"));
    Ok(response)
}

/// Slash command callback
#[utoipa::path(
    post,
    path = "/api/v1/slack/commands",
    request_body(content_type = "application/x-www-form-urlencoded", description = "Slash command form"),
    responses(
        (status = 200, description = "Ephemeral acknowledgement", body = CommandAck),
        (status = 400, description = "Unknown command", body = ApiError)
    ),
    tag = "slack"
)]
pub async fn commands(
    State(state): State<AppState>,
    Form(form): Form<SlashCommand>,
) -> Result<Json<CommandAck>, ApiError> {
    tracing::info!(
        command = %form.command,
        user_id = %form.user_id,
        channel_id = %form.channel_id,
        "Received slash command"
    );
    let command = form.parse().inspect_err(|_| {
        tracing::warn!(command = %form.command, "Invalid command received");
    })?;

    let slack = Arc::clone(&state.slack);
    tokio::spawn(async move {
        slack
            .run_command(&form.team_id, command, &form.response_url)
            .await;
    });

    Ok(Json(CommandAck {
        response_type: "ephemeral".to_string(),
        text: "コマンドを処理中です...".to_string(),
    }))
}

/// Collects the last day of public channel history into the knowledge base
#[utoipa::path(
    post,
    path = "/api/v1/slack/fetch",
    request_body = FetchRequest,
    responses(
        (status = 200, description = "Collection totals", body = FetchResponse),
        (status = 502, description = "Collection failed", body = ApiError)
    ),
    tag = "slack"
)]
pub async fn fetch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<FetchRequest>,
) -> Result<Json<FetchResponse>, ApiError> {
    let outcome = state
        .slack
        .process_fetch_messages(&request.team_id, request.company_id, API_FETCH_DAYS, None)
        .await
        .map_err(|e| {
            tracing::error!(team_id = %request.team_id, error = %e, "Message collection failed");
            ApiError::new(ErrorCode::SlackError, fetch_error_text(&e))
        })?;

    Ok(Json(FetchResponse {
        status: "success".to_string(),
        messages: outcome.messages,
        channels: outcome.channels,
        file_id: outcome.file_id,
    }))
}

/// OAuth authorize URL carrying a fresh install state
#[utoipa::path(
    get,
    path = "/api/v1/slack/authorize-url",
    params(AuthorizeQuery),
    responses((status = 200, description = "Authorize URL", body = AuthorizeUrlResponse)),
    tag = "slack"
)]
pub async fn authorize_url(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AuthorizeQuery>,
) -> Result<Json<AuthorizeUrlResponse>, ApiError> {
    let url = state.slack.create_authorize_url(query.company_id).await?;
    Ok(Json(AuthorizeUrlResponse { url }))
}

/// OAuth redirect target completing the workspace install
#[utoipa::path(
    get,
    path = "/api/v1/slack/install",
    params(InstallQuery),
    responses(
        (status = 200, description = "Workspace installed", body = InstallResponse),
        (status = 400, description = "Invalid or expired state", body = ApiError)
    ),
    tag = "slack"
)]
pub async fn install(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<InstallQuery>,
) -> Result<Json<InstallResponse>, ApiError> {
    let team_id = state.slack.install(&query.code, &query.state).await?;
    Ok(Json(InstallResponse {
        status: "success".to_string(),
        team_id,
        message: "Slackアプリのインストールが完了しました".to_string(),
    }))
}
