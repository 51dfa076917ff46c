//! Slack Web API calls made with a workspace bot token.
//!
//! Every method goes through [`SlackClient::call`], which waits out 429
//! responses using `Retry-After` and turns `{"ok": false}` bodies into
//! [`ClientError::Slack`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{ClientError, check_status, retry_after_secs, trim_base};
use crate::config::SlackConfig;

const SERVICE: &str = "slack";
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const HISTORY_PAGE_SIZE: &str = "200";
const NOTIFY_ATTEMPTS: u32 = 3;

/// A public channel visible to the bot.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SlackChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SlackFile {
    #[serde(default)]
    pub name: String,
}

/// A message from `conversations.history` or `conversations.replies`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SlackMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub ts: String,
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    pub subtype: Option<String>,
    pub thread_ts: Option<String>,
    pub reply_count: Option<u32>,
    #[serde(default)]
    pub files: Vec<SlackFile>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub real_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl SlackUser {
    /// `real_name` when present, otherwise the handle.
    pub fn display_name(&self) -> &str {
        self.real_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTeam {
    pub id: String,
    pub name: Option<String>,
}

/// Successful `oauth.v2.access` response.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthAccess {
    pub access_token: String,
    pub team: OAuthTeam,
    #[serde(default)]
    pub bot_user_id: String,
    #[serde(default)]
    pub scope: String,
}

/// Slack Web API surface used by the Slack endpoints and the collector.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn list_public_channels(&self, token: &str) -> Result<Vec<SlackChannel>, ClientError>;
    async fn join_channel(&self, token: &str, channel: &str) -> Result<(), ClientError>;
    /// All top-level messages in `(oldest, latest]`, following cursors.
    async fn history(
        &self,
        token: &str,
        channel: &str,
        oldest: f64,
        latest: f64,
    ) -> Result<Vec<SlackMessage>, ClientError>;
    /// The parent followed by its replies.
    async fn replies(
        &self,
        token: &str,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, ClientError>;
    async fn channel_members(&self, token: &str, channel: &str)
    -> Result<Vec<String>, ClientError>;
    async fn user_info(&self, token: &str, user: &str) -> Result<SlackUser, ClientError>;
    /// Posts a `chat.postMessage` payload and returns the message `ts`.
    async fn post_message(&self, token: &str, payload: Value) -> Result<String, ClientError>;
    async fn update_message(
        &self,
        token: &str,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ClientError>;
    async fn oauth_access(&self, code: &str) -> Result<OAuthAccess, ClientError>;
    /// Posts `{text}` to a slash-command `response_url`.
    async fn post_response_url(&self, response_url: &str, text: &str) -> Result<(), ClientError>;
}

/// reqwest-backed [`SlackApi`].
pub struct SlackClient {
    http: Client,
    config: SlackConfig,
    notify_backoff: Duration,
}

impl SlackClient {
    pub fn new(http: Client, config: SlackConfig) -> Self {
        Self {
            http,
            config,
            notify_backoff: Duration::from_secs(1),
        }
    }

    /// Base delay between `response_url` attempts; doubles after each failure.
    pub fn with_notify_backoff(mut self, backoff: Duration) -> Self {
        self.notify_backoff = backoff;
        self
    }

    fn url(&self, api_method: &str) -> String {
        format!("{}/{}", trim_base(&self.config.api_base), api_method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        api_method: &str,
        token: Option<&str>,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ClientError> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), self.url(api_method))
                .query(query);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES
            {
                let wait = retry_after_secs(&response).unwrap_or(1);
                tracing::warn!(api_method, wait, "Slack rate limited; waiting");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                attempt += 1;
                continue;
            }

            let value: Value = check_status(SERVICE, response)
                .await?
                .json()
                .await
                .map_err(|e| ClientError::malformed(SERVICE, e))?;
            return parse_ok(value);
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        api_method: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        self.call(Method::GET, api_method, Some(token), query, None)
            .await
    }
}

/// Checks the `ok` flag and deserializes the rest of the body.
fn parse_ok<T: DeserializeOwned>(value: Value) -> Result<T, ClientError> {
    if value.get("ok").and_then(Value::as_bool) != Some(true) {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        return Err(ClientError::Slack { error });
    }
    serde_json::from_value(value).map_err(|e| ClientError::malformed(SERVICE, e))
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

fn next_cursor(meta: Option<ResponseMetadata>) -> Option<String> {
    meta.map(|m| m.next_cursor).filter(|c| !c.is_empty())
}

#[derive(Deserialize)]
struct ChannelPage {
    #[serde(default)]
    channels: Vec<SlackChannel>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct MemberPage {
    #[serde(default)]
    members: Vec<String>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct UserInfo {
    user: SlackUser,
}

#[derive(Deserialize)]
struct PostedMessage {
    ts: String,
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl SlackApi for SlackClient {
    async fn list_public_channels(&self, token: &str) -> Result<Vec<SlackChannel>, ClientError> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("types", "public_channel".to_string()),
                ("limit", "1000".to_string()),
                ("exclude_archived", "true".to_string()),
            ];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }
            let page: ChannelPage = self.get("conversations.list", token, &query).await?;
            channels.extend(page.channels);
            match next_cursor(page.response_metadata) {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(channels)
    }

    async fn join_channel(&self, token: &str, channel: &str) -> Result<(), ClientError> {
        let _: Empty = self
            .call(
                Method::POST,
                "conversations.join",
                Some(token),
                &[("channel", channel.to_string())],
                None,
            )
            .await?;
        Ok(())
    }

    async fn history(
        &self,
        token: &str,
        channel: &str,
        oldest: f64,
        latest: f64,
    ) -> Result<Vec<SlackMessage>, ClientError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("oldest", format!("{:.6}", oldest)),
                ("latest", format!("{:.6}", latest)),
                ("limit", HISTORY_PAGE_SIZE.to_string()),
                ("inclusive", "true".to_string()),
            ];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }
            let page: MessagePage = self.get("conversations.history", token, &query).await?;
            messages.extend(page.messages);
            if !page.has_more {
                break;
            }
            match next_cursor(page.response_metadata) {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn replies(
        &self,
        token: &str,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, ClientError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("ts", thread_ts.to_string()),
                ("limit", HISTORY_PAGE_SIZE.to_string()),
            ];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }
            let page: MessagePage = self.get("conversations.replies", token, &query).await?;
            messages.extend(page.messages);
            if !page.has_more {
                break;
            }
            match next_cursor(page.response_metadata) {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn channel_members(
        &self,
        token: &str,
        channel: &str,
    ) -> Result<Vec<String>, ClientError> {
        let mut members = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("channel", channel.to_string())];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }
            let page: MemberPage = self.get("conversations.members", token, &query).await?;
            members.extend(page.members);
            match next_cursor(page.response_metadata) {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(members)
    }

    async fn user_info(&self, token: &str, user: &str) -> Result<SlackUser, ClientError> {
        let info: UserInfo = self
            .get("users.info", token, &[("user", user.to_string())])
            .await?;
        Ok(info.user)
    }

    async fn post_message(&self, token: &str, payload: Value) -> Result<String, ClientError> {
        let posted: PostedMessage = self
            .call(
                Method::POST,
                "chat.postMessage",
                Some(token),
                &[],
                Some(&payload),
            )
            .await?;
        Ok(posted.ts)
    }

    async fn update_message(
        &self,
        token: &str,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "channel": channel, "ts": ts, "text": text });
        let _: Empty = self
            .call(Method::POST, "chat.update", Some(token), &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn oauth_access(&self, code: &str) -> Result<OAuthAccess, ClientError> {
        let secret = self
            .config
            .client_secret
            .clone()
            .ok_or_else(|| ClientError::NotConfigured("Slack client secret".to_string()))?;

        let response = self
            .http
            .post(self.url("oauth.v2.access"))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let value: Value = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))?;
        parse_ok(value)
    }

    async fn post_response_url(&self, response_url: &str, text: &str) -> Result<(), ClientError> {
        let body = json!({ "text": text });
        let mut last_error = None;
        for attempt in 0..NOTIFY_ATTEMPTS {
            let outcome = match self.http.post(response_url).json(&body).send().await {
                Ok(response) => check_status(SERVICE, response).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Slack notification failed");
                    last_error = Some(e);
                    if attempt + 1 < NOTIFY_ATTEMPTS {
                        tokio::time::sleep(self.notify_backoff * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::malformed(SERVICE, "no attempts made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SlackClient {
        SlackClient::new(
            Client::new(),
            SlackConfig {
                client_id: "cid".to_string(),
                client_secret: Some("csecret".to_string()),
                redirect_uri: "https://app.example/slack/install".to_string(),
                api_base: server.uri(),
                ..Default::default()
            },
        )
        .with_notify_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn ok_false_is_a_slack_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users.info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": false, "error": "user_not_found" })),
            )
            .mount(&server)
            .await;

        let err = client(&server).user_info("xoxb", "U1").await.unwrap_err();
        match err {
            ClientError::Slack { error } => assert_eq!(error, "user_not_found"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn waits_out_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users.info"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users.info"))
            .and(header("authorization", "Bearer xoxb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "user": { "id": "U1", "name": "taro", "real_name": "Taro Yamada" }
            })))
            .mount(&server)
            .await;

        let user = client(&server).user_info("xoxb", "U1").await.unwrap();
        assert_eq!(user.display_name(), "Taro Yamada");
    }

    #[tokio::test]
    async fn history_follows_cursor_while_has_more() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.history"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "messages": [{ "type": "message", "ts": "2.0", "text": "second" }],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations.history"))
            .and(query_param("limit", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "messages": [{ "type": "message", "ts": "1.0", "text": "first", "user": "U1" }],
                "has_more": true,
                "response_metadata": { "next_cursor": "page2" }
            })))
            .mount(&server)
            .await;

        let messages = client(&server)
            .history("xoxb", "C1", 0.0, 10.0)
            .await
            .unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn post_message_returns_ts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(json!({ "channel": "C1" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "ts": "123.456" })),
            )
            .mount(&server)
            .await;

        let ts = client(&server)
            .post_message("xoxb", json!({ "channel": "C1", "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(ts, "123.456");
    }

    #[tokio::test]
    async fn oauth_access_posts_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth.v2.access"))
            .and(body_string_contains("client_secret=csecret"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "access_token": "xoxb-new",
                "team": { "id": "T1", "name": "Acme" },
                "bot_user_id": "B1",
                "scope": "chat:write,commands"
            })))
            .mount(&server)
            .await;

        let access = client(&server).oauth_access("abc").await.unwrap();
        assert_eq!(access.team.id, "T1");
        assert_eq!(access.access_token, "xoxb-new");
    }

    #[tokio::test]
    async fn response_url_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .post_response_url(&format!("{}/hook", server.uri()), "done")
            .await
            .unwrap();
    }
}
