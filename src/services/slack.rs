//! # Slack Service
//!
//! Everything the Slack app does on behalf of an installed workspace:
//!
//! - `app_mention` events post a "which senpai?" select menu into the thread;
//! - picking a senpai answers the question through the company knowledge base;
//! - slash commands collect channel history or edit the company prompt;
//! - the OAuth install flow stores the bot token as an encrypted secret.
//!
//! Bot tokens never leave the `secrets` table unencrypted; every call looks
//! the token up by team id.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use regex::Regex;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::chunking::{ConversationRow, write_csv};
use super::company::{set_prompt_template, upload_csv};
use super::meeting::SYSTEM_SPEAKER;
use super::rag::RagService;
use crate::clients::slack::{SlackChannel, SlackMessage};
use crate::clients::{BlobStore, ClientError, SlackApi};
use crate::config::SlackConfig;
use crate::crypto::CryptoKey;
use crate::db::TenantConnector;
use crate::error::{ApiError, ErrorCode, invalid_request, not_found};
use crate::models::master::slack_workspace;
use crate::repositories::{
    SecretRepository, SlackInstallStateRepository, SlackWorkspaceRepository, slack_token_name,
};

pub const EVENT_DEDUPE_TTL: Duration = Duration::from_secs(300);
pub const MEMBER_CACHE_TTL: Duration = Duration::from_secs(600);
const CACHE_CAPACITY: usize = 1024;

pub const CHANNEL_CHUNK_SIZE: usize = 5;
const CHUNK_PAUSE: Duration = Duration::from_secs(2);
pub const COMMAND_FETCH_DAYS: i64 = 7;
pub const API_FETCH_DAYS: i64 = 1;

pub const SENPAI_SELECT_ACTION: &str = "senpai_select";
const SENPAI_QUESTION_EVENT: &str = "senpai_question";
pub const ANSWER_TOP_K: usize = 10;
pub const ANSWER_ERROR_TEXT: &str = "申し訳ありません。回答の生成中にエラーが発生しました。";
const COMMAND_ERROR_TEXT: &str = "エラーが発生しました。管理者にお問い合わせください。";

const AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
pub const INSTALL_STATE_TTL_MINUTES: i64 = 10;
pub const BOT_SCOPES: [&str; 13] = [
    "app_mentions:read",
    "channels:history",
    "channels:read",
    "chat:write",
    "commands",
    "groups:history",
    "groups:read",
    "im:history",
    "im:read",
    "mpim:history",
    "mpim:read",
    "users:read",
    "channels:join",
];

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>").expect("valid regex"));

/// Small LRU map whose entries expire after a fixed TTL.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<LruCache<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.entries
            .lock()
            .await
            .put(key.into(), (Instant::now(), value));
    }
}

impl TtlCache<()> {
    /// Records `key` and reports whether it was already seen within the TTL.
    pub async fn seen(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if let Some((at, _)) = entries.get(key) {
            if at.elapsed() < self.ttl {
                return true;
            }
        }
        entries.put(key.to_string(), (Instant::now(), ()));
        false
    }
}

/// Events API callback body.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub challenge: Option<String>,
    pub team_id: Option<String>,
    pub event_id: Option<String>,
    pub event: Option<MentionEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MentionEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub ts: String,
    pub thread_ts: Option<String>,
    pub team: Option<String>,
}

/// One message of the thread a question was asked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
}

impl From<&SlackMessage> for ThreadMessage {
    fn from(message: &SlackMessage) -> Self {
        Self {
            user: message.user.clone().unwrap_or_default(),
            text: message.text.clone(),
            ts: message.ts.clone(),
        }
    }
}

/// A selectable channel member.
#[derive(Debug, Clone, PartialEq)]
pub struct SenpaiOption {
    pub text: String,
    pub value: String,
}

/// A senpai picked from the select menu, with the question it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct SenpaiSelection {
    pub team_id: String,
    pub channel: String,
    pub thread_ts: String,
    pub senpai: String,
    pub question: String,
    pub thread_messages: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Deserialize)]
struct SelectedOption {
    value: String,
}

#[derive(Deserialize)]
struct BlockAction {
    #[serde(default)]
    action_id: String,
    selected_option: Option<SelectedOption>,
}

#[derive(Deserialize, Default)]
struct QuestionPayload {
    #[serde(default)]
    question: String,
    #[serde(default)]
    thread_messages: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct MessageMetadata {
    #[serde(default)]
    event_payload: QuestionPayload,
}

#[derive(Deserialize)]
struct InteractionMessage {
    ts: String,
    metadata: Option<MessageMetadata>,
}

#[derive(Deserialize)]
struct InteractionPayload {
    team: Option<IdRef>,
    #[serde(default)]
    actions: Vec<BlockAction>,
    channel: Option<IdRef>,
    message: Option<InteractionMessage>,
}

/// Reads the `payload` form field of a block action.
pub fn parse_interaction(raw: &str) -> Result<SenpaiSelection, ApiError> {
    let payload: InteractionPayload =
        serde_json::from_str(raw).map_err(|_| invalid_request("payload not found"))?;

    let team_id = payload
        .team
        .map(|t| t.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| invalid_request("team_idが見つかりません"))?;

    let action = payload
        .actions
        .into_iter()
        .next()
        .filter(|a| a.action_id == SENPAI_SELECT_ACTION)
        .ok_or_else(|| invalid_request("不正なアクションIDです"))?;
    let senpai = action
        .selected_option
        .map(|o| o.value)
        .ok_or_else(|| invalid_request("選択された先輩が見つかりません"))?;

    let channel = payload
        .channel
        .map(|c| c.id)
        .ok_or_else(|| invalid_request("channel not found"))?;
    let message = payload
        .message
        .ok_or_else(|| invalid_request("message not found"))?;
    let question = message
        .metadata
        .map(|m| m.event_payload)
        .unwrap_or_default();

    Ok(SenpaiSelection {
        team_id,
        channel,
        thread_ts: message.ts,
        senpai,
        question: question.question,
        thread_messages: question.thread_messages,
    })
}

/// Slash command form fields.
#[derive(Debug, Clone, Deserialize)]
pub struct SlashCommand {
    pub team_id: String,
    pub command: String,
    #[serde(default)]
    pub text: String,
    pub response_url: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FetchMessages,
    ResetPrompt,
    SetPrompt(String),
}

impl SlashCommand {
    pub fn parse(&self) -> Result<Command, ApiError> {
        match self.command.as_str() {
            "/fetch-messages" => Ok(Command::FetchMessages),
            "/reset-prompt" => Ok(Command::ResetPrompt),
            "/set-prompt" => Ok(Command::SetPrompt(self.text.trim().to_string())),
            _ => Err(invalid_request("無効なコマンドです")),
        }
    }
}

/// Totals from one collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub messages: usize,
    pub channels: usize,
    pub file_id: Option<Uuid>,
}

pub fn strip_mentions(text: &str) -> String {
    USER_MENTION.replace_all(text, "").trim().to_string()
}

/// `chat.postMessage` body with the senpai select menu.
pub fn senpai_select_payload(
    channel: &str,
    user: &str,
    question: &str,
    thread_ts: Option<&str>,
    thread_messages: &[ThreadMessage],
    options: &[SenpaiOption],
) -> Value {
    let quoted = question
        .split('\n')
        .map(|line| format!(">{}", line))
        .collect::<Vec<_>>()
        .join("\n");
    let options: Vec<Value> = options
        .iter()
        .map(|o| {
            json!({
                "text": { "type": "plain_text", "text": o.text },
                "value": o.value,
            })
        })
        .collect();

    let mut payload = json!({
        "channel": channel,
        "text": format!("Hey <@{}> 先輩を選んでください！", user),
        "blocks": [{
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*質問内容*:\n{}\n\nどの先輩に質問しますか？", quoted),
            },
            "accessory": {
                "type": "static_select",
                "action_id": SENPAI_SELECT_ACTION,
                "placeholder": { "type": "plain_text", "text": "先輩を選ぶ" },
                "options": options,
            },
        }],
        "metadata": {
            "event_type": SENPAI_QUESTION_EVENT,
            "event_payload": {
                "question": question,
                "thread_ts": thread_ts,
                "thread_messages": thread_messages,
                "senpai": Value::Null,
            },
        },
    });
    if let Some(ts) = thread_ts {
        payload["thread_ts"] = json!(ts);
    }
    payload
}

/// Retrieval query for a senpai answer, carrying the thread as context.
pub fn senpai_thread_query(senpai_name: &str, thread: &[ThreadMessage], question: &str) -> String {
    let context = thread
        .iter()
        .map(|m| format!("User {}: {}", m.user, m.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "以下の質問について、{}の発言を中心に回答してください。\n\nスレッドのコンテキスト:\n{}\n\n質問: {}",
        senpai_name, context, question
    )
}

/// Slack `ts` (`"1712345678.000200"`) as `%Y-%m-%d %H:%M:%S` UTC.
pub fn format_slack_ts(ts: &str) -> Option<String> {
    let seconds: f64 = ts.parse().ok()?;
    DateTime::<Utc>::from_timestamp(seconds.trunc() as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// CSV row for a collected message. Replies point at their parent.
pub fn message_row(message: &SlackMessage, channel: &str, user_name: Option<&str>) -> ConversationRow {
    let parent_timestamp = match message.thread_ts.as_deref() {
        Some(thread_ts) if thread_ts != message.ts => format_slack_ts(thread_ts).unwrap_or_default(),
        _ => String::new(),
    };
    ConversationRow {
        timestamp: format_slack_ts(&message.ts).unwrap_or_default(),
        user_id: message
            .user
            .clone()
            .unwrap_or_else(|| SYSTEM_SPEAKER.to_string()),
        user_name: user_name.unwrap_or(SYSTEM_SPEAKER).to_string(),
        channel: channel.to_string(),
        message: message.text.clone(),
        attachments: message
            .files
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join("; "),
        parent_timestamp,
    }
}

/// Company id out of an install `state` of the form `{uuid}_{company_id}`.
pub fn parse_install_state(state: &str) -> Result<Uuid, ApiError> {
    let invalid = || invalid_request("Invalid state format");
    let (nonce, company) = state.split_once('_').ok_or_else(invalid)?;
    if nonce.is_empty() || company.contains('_') {
        return Err(invalid());
    }
    Uuid::parse_str(company).map_err(|_| invalid())
}

pub fn fetch_error_text(error: &ApiError) -> String {
    format!("メッセージ取得中にエラーが発生しました: {}", error.message)
}

pub struct SlackService {
    master: DatabaseConnection,
    tenants: Arc<TenantConnector>,
    crypto_key: Option<CryptoKey>,
    api: Arc<dyn SlackApi>,
    rag: Arc<RagService>,
    blob: Arc<dyn BlobStore>,
    config: SlackConfig,
    seen_events: TtlCache<()>,
    members: TtlCache<Vec<SenpaiOption>>,
    chunk_pause: Duration,
}

impl SlackService {
    pub fn new(
        master: DatabaseConnection,
        tenants: Arc<TenantConnector>,
        crypto_key: Option<CryptoKey>,
        api: Arc<dyn SlackApi>,
        rag: Arc<RagService>,
        blob: Arc<dyn BlobStore>,
        config: SlackConfig,
    ) -> Self {
        Self {
            master,
            tenants,
            crypto_key,
            api,
            rag,
            blob,
            config,
            seen_events: TtlCache::new(EVENT_DEDUPE_TTL, CACHE_CAPACITY),
            members: TtlCache::new(MEMBER_CACHE_TTL, CACHE_CAPACITY),
            chunk_pause: CHUNK_PAUSE,
        }
    }

    /// Pause between channel chunks while collecting.
    pub fn with_chunk_pause(mut self, pause: Duration) -> Self {
        self.chunk_pause = pause;
        self
    }

    fn secrets(&self) -> Result<SecretRepository<'_>, ApiError> {
        let key = self.crypto_key.as_ref().ok_or_else(|| {
            ApiError::new(ErrorCode::ConfigError, "INTHUB_CRYPTO_KEY is not configured")
        })?;
        Ok(SecretRepository::new(&self.master, key))
    }

    async fn bot_token(&self, team_id: &str) -> Result<String, ApiError> {
        self.secrets()?
            .get(&slack_token_name(team_id))
            .await?
            .ok_or_else(|| {
                ApiError::new(ErrorCode::SlackTokenError, "Slackトークンの取得に失敗しました")
            })
    }

    pub async fn workspace(&self, team_id: &str) -> Result<slack_workspace::Model, ApiError> {
        SlackWorkspaceRepository::new(&self.master)
            .find_by_team_id(team_id)
            .await?
            .ok_or_else(|| {
                not_found("Slackワークスペースが見つかりません")
                    .with_details(json!({ "team_id": team_id }))
            })
    }

    async fn tenant_db(&self, company_id: Uuid) -> Result<DatabaseConnection, ApiError> {
        let (_, db) = self.tenants.for_company(&self.master, company_id).await?;
        Ok(db)
    }

    async fn notify(&self, response_url: &str, text: &str) {
        if let Err(e) = self.api.post_response_url(response_url, text).await {
            tracing::error!(error = %e, "Failed to send Slack notification");
        }
    }

    /// True when `event_id` was already delivered within the dedupe window.
    pub async fn is_duplicate_event(&self, event_id: &str) -> bool {
        self.seen_events.seen(event_id).await
    }

    /// Spawns mention handling for `app_mention` callbacks; other events are ignored.
    pub fn dispatch_event(self: &Arc<Self>, envelope: EventEnvelope) {
        let Some(event) = envelope.event else {
            return;
        };
        if event.kind != "app_mention" {
            tracing::debug!(kind = %event.kind, "Ignoring Slack event");
            return;
        }
        let Some(team_id) = event.team.clone().or(envelope.team_id) else {
            tracing::error!("team_id not found in event");
            return;
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.handle_mention(&team_id, &event).await {
                tracing::error!(team_id, error = %e, "Error in handle_mention");
            }
        });
    }

    /// Posts the senpai select menu in reply to a mention.
    pub async fn handle_mention(&self, team_id: &str, event: &MentionEvent) -> Result<(), ApiError> {
        let token = self.bot_token(team_id).await?;
        let user = event.user.as_deref().unwrap_or_default();
        let question = strip_mentions(&event.text);
        tracing::info!(team_id, channel = %event.channel, user, "Processing mention");

        let thread_messages = match event.thread_ts.as_deref() {
            Some(thread_ts) => self.thread_messages(&token, &event.channel, thread_ts).await,
            None => vec![ThreadMessage {
                user: user.to_string(),
                text: event.text.clone(),
                ts: event.ts.clone(),
            }],
        };

        let options = self.senpai_options(&token, &event.channel).await?;
        if options.is_empty() {
            return Err(ApiError::new(
                ErrorCode::SlackUserError,
                format!("No channel members found for channel {}", event.channel),
            ));
        }

        let payload = senpai_select_payload(
            &event.channel,
            user,
            &question,
            event.thread_ts.as_deref(),
            &thread_messages,
            &options,
        );
        self.api.post_message(&token, payload).await?;
        tracing::info!(team_id, channel = %event.channel, options = options.len(), "Select menu sent");
        Ok(())
    }

    /// Top-level thread messages in `ts` order. Failures yield an empty thread.
    async fn thread_messages(&self, token: &str, channel: &str, thread_ts: &str) -> Vec<ThreadMessage> {
        match self.api.replies(token, channel, thread_ts).await {
            Ok(mut messages) => {
                messages.sort_by(|a, b| {
                    let a: f64 = a.ts.parse().unwrap_or_default();
                    let b: f64 = b.ts.parse().unwrap_or_default();
                    a.total_cmp(&b)
                });
                messages
                    .iter()
                    .filter(|m| m.kind == "message" && m.subtype.is_none())
                    .map(ThreadMessage::from)
                    .collect()
            }
            Err(e) => {
                tracing::error!(channel, error = %e, "Error getting thread messages");
                Vec::new()
            }
        }
    }

    /// Human channel members as select options, cached per channel.
    async fn senpai_options(&self, token: &str, channel: &str) -> Result<Vec<SenpaiOption>, ApiError> {
        if let Some(cached) = self.members.get(channel).await {
            return Ok(cached);
        }

        let mut options = Vec::new();
        for member in self.api.channel_members(token, channel).await? {
            match self.api.user_info(token, &member).await {
                Ok(user) if !user.is_bot && !user.deleted && user.id != "USLACKBOT" => {
                    options.push(SenpaiOption {
                        text: format!("{}先輩", user.display_name()),
                        value: user.id,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(member, error = %e, "Skipping member without user info"),
            }
        }
        tracing::info!(channel, members = options.len(), "Loaded channel members");
        self.members.insert(channel, options.clone()).await;
        Ok(options)
    }

    /// Answers a select-menu choice and edits the loading message with the result.
    pub async fn answer_selection(
        &self,
        selection: &SenpaiSelection,
        company_id: Uuid,
    ) -> Result<(), ApiError> {
        let token = self.bot_token(&selection.team_id).await?;

        let senpai_name = match self.api.user_info(&token, &selection.senpai).await {
            Ok(user) if !user.display_name().is_empty() => user.display_name().to_string(),
            Ok(_) => selection.senpai.clone(),
            Err(e) => {
                tracing::warn!(senpai = %selection.senpai, error = %e, "Failed to get user info");
                selection.senpai.clone()
            }
        };

        let loading_ts = self
            .api
            .post_message(
                &token,
                json!({
                    "channel": selection.channel,
                    "text": format!("*{}* について回答を生成中です...", senpai_name),
                    "thread_ts": selection.thread_ts,
                }),
            )
            .await?;

        let query = senpai_thread_query(&senpai_name, &selection.thread_messages, &selection.question);
        let answer = async {
            let db = self.tenant_db(company_id).await?;
            self.rag
                .query_index(&db, company_id, &query, ANSWER_TOP_K)
                .await
        }
        .await;

        let text = match answer {
            Ok(answer) => format!("*{}* からの回答です:\n{}", senpai_name, answer.answer),
            Err(e) => {
                tracing::error!(%company_id, error = %e, "Error in RAG processing");
                ANSWER_ERROR_TEXT.to_string()
            }
        };
        self.api
            .update_message(&token, &selection.channel, &loading_ts, &text)
            .await?;
        Ok(())
    }

    /// Runs a slash command, reporting progress to its `response_url`.
    pub async fn run_command(&self, team_id: &str, command: Command, response_url: &str) {
        let outcome = async {
            let company_id = self.workspace(team_id).await?.tenant_id;
            match command {
                Command::FetchMessages => {
                    self.notify(
                        response_url,
                        "メッセージの取得を開始しました。処理状況は後ほど通知されます。",
                    )
                    .await;
                    if let Err(e) = self
                        .process_fetch_messages(team_id, company_id, COMMAND_FETCH_DAYS, Some(response_url))
                        .await
                    {
                        tracing::error!(team_id, error = %e, "Message collection failed");
                        self.notify(response_url, &fetch_error_text(&e)).await;
                    }
                }
                Command::ResetPrompt => {
                    let db = self.tenant_db(company_id).await?;
                    set_prompt_template(&db, company_id, "").await?;
                    self.notify(response_url, "プロンプトをリセットしました。").await;
                }
                Command::SetPrompt(text) if text.is_empty() => {
                    self.notify(response_url, "プロンプトの内容を指定してください。")
                        .await;
                }
                Command::SetPrompt(text) => {
                    let db = self.tenant_db(company_id).await?;
                    set_prompt_template(&db, company_id, &text).await?;
                    self.notify(response_url, "プロンプトを更新しました。").await;
                }
            }
            Ok::<_, ApiError>(())
        }
        .await;

        if let Err(e) = outcome {
            tracing::error!(team_id, error = %e, "Error in command processing");
            self.notify(response_url, COMMAND_ERROR_TEXT).await;
        }
    }

    /// Collects the last `days` of public channel history into one CSV and indexes it.
    pub async fn process_fetch_messages(
        &self,
        team_id: &str,
        company_id: Uuid,
        days: i64,
        response_url: Option<&str>,
    ) -> Result<FetchOutcome, ApiError> {
        let token = self.bot_token(team_id).await?;

        let mut joined: Vec<SlackChannel> = Vec::new();
        for channel in self.api.list_public_channels(&token).await? {
            match self.api.join_channel(&token, &channel.id).await {
                Ok(()) => joined.push(channel),
                Err(e) => tracing::warn!(channel = %channel.id, error = %e, "Error joining channel"),
            }
        }
        if joined.is_empty() {
            return Err(ApiError::new(
                ErrorCode::SlackChannelError,
                "チャンネルへの参加に失敗しました",
            ));
        }

        let job_id = format!(
            "job_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..6]
        );
        tracing::info!(team_id, job_id, channels = joined.len(), "Starting message collection");
        if let Some(url) = response_url {
            let text = format!(
                "メッセージの取得を開始しました。\nジョブID: {}\n対象チャンネル数: {}\n処理が完了するまでお待ちください。",
                job_id,
                joined.len()
            );
            self.notify(url, &text).await;
        }

        let latest = Utc::now();
        let oldest = latest - chrono::Duration::days(days);
        let mut user_names: HashMap<String, Option<String>> = HashMap::new();
        let mut rows = Vec::new();
        let mut failed_channels = 0usize;

        for (i, chunk) in joined.chunks(CHANNEL_CHUNK_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chunk_pause).await;
            }
            for channel in chunk {
                match self
                    .channel_rows(&token, channel, oldest, latest, &mut user_names)
                    .await
                {
                    Ok(channel_rows) => rows.extend(channel_rows),
                    Err(e) => {
                        failed_channels += 1;
                        tracing::error!(channel = %channel.id, error = %e, "Error collecting channel");
                    }
                }
            }
        }

        let file_id = if rows.is_empty() {
            tracing::info!(team_id, "No messages collected; skipping upload");
            None
        } else {
            let db = self.tenant_db(company_id).await?;
            let csv = write_csv(&rows).map_err(|e| {
                ApiError::new(ErrorCode::InternalServerError, "CSVの作成に失敗しました")
                    .with_details(json!({ "error": e.to_string() }))
            })?;
            let name = format!("slack_{}_{}.csv", team_id, latest.format("%Y%m%d%H%M%S"));
            let file = upload_csv(self.blob.as_ref(), &db, company_id, &name, Some("text/csv"), csv)
                .await?;
            self.rag.build_index(&db, company_id, file.id).await?;
            Some(file.id)
        };

        if let Err(e) = SlackWorkspaceRepository::new(&self.master)
            .mark_synced(team_id, latest)
            .await
        {
            tracing::error!(team_id, error = %e, "Error updating last_sync_at");
        }

        tracing::info!(
            team_id,
            job_id,
            channels = joined.len(),
            failed_channels,
            messages = rows.len(),
            "Message collection completed"
        );
        if let Some(url) = response_url {
            let text = format!(
                "メッセージの取得が完了しました。\nジョブID: {}\n合計取得件数: {}件\n対象チャンネル数: {}\n失敗したチャンネル数: {}",
                job_id,
                rows.len(),
                joined.len(),
                failed_channels
            );
            self.notify(url, &text).await;
        }

        Ok(FetchOutcome {
            messages: rows.len(),
            channels: joined.len(),
            file_id,
        })
    }

    async fn channel_rows(
        &self,
        token: &str,
        channel: &SlackChannel,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
        user_names: &mut HashMap<String, Option<String>>,
    ) -> Result<Vec<ConversationRow>, ClientError> {
        let label = if channel.name.is_empty() {
            channel.id.as_str()
        } else {
            channel.name.as_str()
        };
        let oldest = oldest.timestamp_micros() as f64 / 1_000_000.0;
        let latest = latest.timestamp_micros() as f64 / 1_000_000.0;

        let mut rows = Vec::new();
        for message in self.api.history(token, &channel.id, oldest, latest).await? {
            if message.subtype.is_some() {
                continue;
            }
            let name = self.user_name(token, message.user.as_deref(), user_names).await;
            rows.push(message_row(&message, label, name.as_deref()));

            let Some(thread_ts) = message.thread_ts.as_deref() else {
                continue;
            };
            if message.reply_count.unwrap_or(0) == 0 {
                continue;
            }
            for reply in self.api.replies(token, &channel.id, thread_ts).await? {
                if reply.ts == thread_ts || reply.subtype.is_some() {
                    continue;
                }
                let name = self.user_name(token, reply.user.as_deref(), user_names).await;
                rows.push(message_row(&reply, label, name.as_deref()));
            }
        }
        Ok(rows)
    }

    async fn user_name(
        &self,
        token: &str,
        user: Option<&str>,
        cache: &mut HashMap<String, Option<String>>,
    ) -> Option<String> {
        let user = user?;
        if let Some(name) = cache.get(user) {
            return name.clone();
        }
        let name = match self.api.user_info(token, user).await {
            Ok(info) => info.real_name.filter(|n| !n.is_empty()),
            Err(e) => {
                tracing::warn!(user, error = %e, "Error fetching user info");
                None
            }
        };
        cache.insert(user.to_string(), name.clone());
        name
    }

    /// Authorize URL for `state`.
    pub fn authorize_url(&self, state: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", &BOT_SCOPES.join(","))
            .append_pair("user_scope", "")
            .append_pair("state", state)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .finish();
        format!("{}?{}", AUTHORIZE_URL, query)
    }

    /// Stores a fresh install state for the company and returns the authorize URL.
    pub async fn create_authorize_url(&self, company_id: Uuid) -> Result<String, ApiError> {
        let state = format!("{}_{}", Uuid::new_v4(), company_id);
        SlackInstallStateRepository::new(&self.master)
            .create(
                company_id,
                &state,
                chrono::Duration::minutes(INSTALL_STATE_TTL_MINUTES),
            )
            .await?;
        Ok(self.authorize_url(&state))
    }

    /// Completes the OAuth install and returns the workspace team id.
    pub async fn install(&self, code: &str, state: &str) -> Result<String, ApiError> {
        let company_id = parse_install_state(state)?;
        let consumed = SlackInstallStateRepository::new(&self.master)
            .consume(company_id, state, Utc::now())
            .await?;
        if !consumed {
            return Err(invalid_request("Invalid state"));
        }

        let access = self.api.oauth_access(code).await?;
        let team_id = access.team.id;
        self.secrets()?
            .put(&slack_token_name(&team_id), &access.access_token)
            .await?;

        let scopes = access
            .scope
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let bot_user_id = Some(access.bot_user_id).filter(|id| !id.is_empty());
        SlackWorkspaceRepository::new(&self.master)
            .upsert(company_id, &team_id, bot_user_id, scopes)
            .await?;

        tracing::info!(%company_id, team_id, "Slack workspace installed");
        Ok(team_id)
    }
}
