//! Bot Framework (Microsoft Teams) inbound auth and outbound replies.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use super::jwks::{JwksVerifier, KeySource};
use super::{ClientError, check_status, trim_base};
use crate::config::TeamsConfig;

const SERVICE: &str = "bot-framework";
const ISSUER: &str = "https://api.botframework.com";
const SCOPE: &str = "https://api.botframework.com/.default";
/// Tokens are refreshed this long before they expire.
const TOKEN_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationAccount {
    pub id: String,
}

/// The subset of a Bot Framework activity the bot reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub id: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub service_url: String,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default)]
    pub from: ChannelAccount,
    #[serde(default)]
    pub recipient: ChannelAccount,
    #[serde(default)]
    pub members_added: Vec<ChannelAccount>,
}

/// Verifies inbound activities and sends replies into the conversation.
#[async_trait]
pub trait BotConnector: Send + Sync {
    /// Validates the `Authorization` header sent with an activity.
    async fn verify(&self, authorization: &str) -> Result<(), ClientError>;
    async fn reply(&self, activity: &Activity, text: &str) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct BotClaims {}

/// reqwest-backed [`BotConnector`].
pub struct BotFrameworkClient {
    http: Client,
    config: TeamsConfig,
    keys: JwksVerifier,
    token: Mutex<Option<(String, Instant)>>,
}

impl BotFrameworkClient {
    pub fn new(http: Client, config: TeamsConfig) -> Self {
        let keys = JwksVerifier::new(
            http.clone(),
            KeySource::OpenIdMetadata(config.openid_metadata_url.clone()),
        );
        Self {
            http,
            config,
            keys,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ClientError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() + TOKEN_SKEW < *expires_at {
                return Ok(token.clone());
            }
        }

        let password = self
            .config
            .app_password
            .as_deref()
            .ok_or_else(|| ClientError::NotConfigured("Microsoft app password".to_string()))?;
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", password),
                ("scope", SCOPE),
            ])
            .send()
            .await?;
        let token: AccessToken = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }
}

#[async_trait]
impl BotConnector for BotFrameworkClient {
    async fn verify(&self, authorization: &str) -> Result<(), ClientError> {
        let token = authorization
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Verification("missing bearer token".to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.config.app_id]);
        validation.set_issuer(&[ISSUER]);
        let _: BotClaims = self.keys.verify(token, &validation).await?;
        Ok(())
    }

    async fn reply(&self, activity: &Activity, text: &str) -> Result<(), ClientError> {
        let activity_id = activity.id.as_deref().unwrap_or_default();
        let url = format!(
            "{}/v3/conversations/{}/activities/{}",
            trim_base(&activity.service_url),
            activity.conversation.id,
            activity_id
        );
        let body = json!({
            "type": "message",
            "text": text,
            "from": activity.recipient,
            "recipient": activity.from,
            "conversation": activity.conversation,
            "replyToId": activity_id,
        });

        let token = self.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::jwks::test_keys;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> TeamsConfig {
        TeamsConfig {
            app_id: "bot-app".to_string(),
            app_password: Some("pw".to_string()),
            openid_metadata_url: format!("{}/openid", server.uri()),
            token_url: format!("{}/token", server.uri()),
        }
    }

    async fn mount_keys(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/openid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwks_uri": format!("{}/keys", server.uri()),
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_keys::jwks_json()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn accepts_token_for_this_bot() {
        let server = MockServer::start().await;
        mount_keys(&server).await;
        let client = BotFrameworkClient::new(Client::new(), config(&server));

        let exp = chrono::Utc::now().timestamp() + 600;
        let token = test_keys::sign(&json!({
            "aud": "bot-app",
            "iss": "https://api.botframework.com",
            "exp": exp,
        }));
        client.verify(&format!("Bearer {}", token)).await.unwrap();

        let other = test_keys::sign(&json!({
            "aud": "another-bot",
            "iss": "https://api.botframework.com",
            "exp": exp,
        }));
        assert!(client.verify(&format!("Bearer {}", other)).await.is_err());
        assert!(client.verify("").await.is_err());
    }

    #[tokio::test]
    async fn reply_posts_to_conversation_with_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "bot-token",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/conversations/conv-1/activities/act-1"))
            .and(header("authorization", "Bearer bot-token"))
            .and(body_partial_json(json!({
                "type": "message",
                "text": "エコー: hi",
                "replyToId": "act-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "r1" })))
            .expect(2)
            .mount(&server)
            .await;

        let client = BotFrameworkClient::new(Client::new(), config(&server));
        let activity = Activity {
            kind: "message".to_string(),
            id: Some("act-1".to_string()),
            service_url: server.uri(),
            conversation: ConversationAccount {
                id: "conv-1".to_string(),
            },
            ..Default::default()
        };
        client.reply(&activity, "エコー: hi").await.unwrap();
        client.reply(&activity, "エコー: hi").await.unwrap();
    }
}
