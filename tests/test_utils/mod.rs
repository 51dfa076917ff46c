//! Shared fixtures for the integration tests.
//!
//! Every upstream service is replaced by an in-memory fake, the master
//! database is an in-memory SQLite pool and tenant databases are opened from
//! the `sqlite::memory:` template, so each company gets a private database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode},
};
use inthub::{
    clients::{
        BlobItem, BlobStore, BotConnector, ChatRequest, ClientError, IdTokenClaims,
        IdentityProvider, LanguageModel, Policy, SearchDocument, SearchHit, SlackApi, TokenSet,
        VectorIndex,
        bot_framework::Activity,
        slack::{OAuthAccess, OAuthTeam, SlackChannel, SlackMessage, SlackUser},
    },
    config::AppConfig,
    db::TenantConnector,
    server::{AppState, Clients, create_app},
    services::company::create_company,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const BASIC_USER: &str = "connector";
pub const BASIC_PASSWORD: &str = "connector-secret";
pub const SIGNING_SECRET: &str = "slack-signing-secret";
pub const EXTENSION_ID: &str = "0a1b2c3d-4e5f-6789-abcd-ef0123456789";

/// Sets up an in-memory SQLite master database with the master schema.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.profile = "test".to_string();
    config.tenant_database_url_template = "sqlite::memory:".to_string();
    config.crypto_key = Some(vec![3u8; 32]);
    config.b2c.extension_id = EXTENSION_ID.to_string();
    config.b2c.basic_user = BASIC_USER.to_string();
    config.b2c.basic_password = Some(BASIC_PASSWORD.to_string());
    config.slack.client_id = "client-id".to_string();
    config.slack.redirect_uri = "https://inthub.test/api/v1/slack/install".to_string();
    config.slack.signing_secret = Some(SIGNING_SECRET.to_string());
    config
}

/// Identity provider whose tokens are looked up in a table.
#[derive(Default)]
pub struct FakeIdentity {
    tokens: Mutex<HashMap<String, IdTokenClaims>>,
}

impl FakeIdentity {
    pub fn grant(&self, token: &str, claims: IdTokenClaims) {
        self.tokens.lock().unwrap().insert(token.to_string(), claims);
    }

    fn lookup(&self, token: &str) -> Result<IdTokenClaims, ClientError> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| ClientError::Verification("unknown token".to_string()))
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn exchange_code(&self, _policy: Policy, code: &str) -> Result<TokenSet, ClientError> {
        self.lookup(code)?;
        Ok(TokenSet {
            id_token: Some(code.to_string()),
            access_token: Some(code.to_string()),
            refresh_token: Some(format!("refresh-{}", code)),
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ClientError> {
        let token = refresh_token
            .strip_prefix("refresh-")
            .ok_or_else(|| ClientError::Verification("bad refresh token".to_string()))?;
        Ok(TokenSet {
            id_token: Some(token.to_string()),
            access_token: Some(token.to_string()),
            refresh_token: Some(refresh_token.to_string()),
        })
    }

    async fn verify_token(&self, _policy: Policy, token: &str) -> Result<IdTokenClaims, ClientError> {
        self.lookup(token)
    }
}

pub fn claims(sub: &str, company_id: Uuid, role: &str, email: &str) -> IdTokenClaims {
    IdTokenClaims {
        emails: vec![email.to_string()],
        name: Some("Taro Yamada".to_string()),
        sub: Some(sub.to_string()),
        company_id: Some(company_id.to_string()),
        role: Some(role.to_string()),
    }
}

/// Blob container kept in memory, keyed by URL.
#[derive(Default)]
pub struct FakeBlobStore {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeBlobStore {
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter_map(|url| url.strip_prefix("https://blob.test/data/").map(String::from))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(
        &self,
        name: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, ClientError> {
        let url = self.url_for(name);
        self.blobs.lock().unwrap().insert(url.clone(), data);
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(ClientError::Upstream {
                service: "blob storage",
                status: 404,
                body: String::new(),
            })
    }

    async fn delete(&self, url: &str) -> Result<(), ClientError> {
        self.blobs.lock().unwrap().remove(url);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>, ClientError> {
        let blobs = self.blobs.lock().unwrap();
        let mut items: Vec<BlobItem> = blobs
            .iter()
            .filter_map(|(url, data)| {
                let name = url.strip_prefix("https://blob.test/data/")?;
                name.starts_with(prefix).then(|| BlobItem {
                    name: name.to_string(),
                    size: data.len() as i64,
                    created_at: None,
                })
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn url_for(&self, name: &str) -> String {
        format!("https://blob.test/data/{}", name)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Language model that embeds everything to the same vector.
///
/// Chat requests are recorded; rerank prompts score 8 and everything else
/// gets `answer`.
pub struct FakeLanguageModel {
    pub answer: String,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl Default for FakeLanguageModel {
    fn default() -> Self {
        Self {
            answer: "有給休暇は人事ポータルから申請します。".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LanguageModel for FakeLanguageModel {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        Ok(inputs.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, ClientError> {
        let rerank = request
            .messages
            .last()
            .is_some_and(|m| m.content.contains("評価 (数値のみ)"));
        self.requests.lock().unwrap().push(request);
        Ok(if rerank {
            "8".to_string()
        } else {
            self.answer.clone()
        })
    }
}

/// Vector index holding documents per index name.
#[derive(Default)]
pub struct FakeVectorIndex {
    pub indexes: Mutex<HashMap<String, Vec<SearchDocument>>>,
}

impl FakeVectorIndex {
    pub fn documents(&self, index: &str) -> Vec<SearchDocument> {
        self.indexes
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

fn hit(doc: &SearchDocument) -> SearchHit {
    SearchHit {
        id: doc.id.clone(),
        content: doc.content.clone(),
        score: 0.9,
    }
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn ensure_index(&self, index: &str) -> Result<(), ClientError> {
        self.indexes
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default();
        Ok(())
    }

    async fn upload_documents(
        &self,
        index: &str,
        documents: Vec<SearchDocument>,
    ) -> Result<(), ClientError> {
        self.indexes
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .extend(documents);
        Ok(())
    }

    async fn vector_search(
        &self,
        index: &str,
        _vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, ClientError> {
        Ok(self.documents(index).iter().take(top_k).map(hit).collect())
    }

    async fn list_documents(&self, index: &str, top: usize) -> Result<Vec<SearchHit>, ClientError> {
        Ok(self.documents(index).iter().take(top).map(hit).collect())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), ClientError> {
        if let Some(docs) = self.indexes.lock().unwrap().get_mut(index) {
            docs.retain(|d| d.id != id);
        }
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), ClientError> {
        self.indexes.lock().unwrap().remove(index);
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.indexes.lock().unwrap().keys().cloned().collect())
    }
}

/// Bot connector accepting `Bearer bot-token` and recording replies.
#[derive(Default)]
pub struct FakeBot {
    pub replies: Mutex<Vec<String>>,
}

#[async_trait]
impl BotConnector for FakeBot {
    async fn verify(&self, authorization: &str) -> Result<(), ClientError> {
        if authorization == "Bearer bot-token" {
            Ok(())
        } else {
            Err(ClientError::Verification("bad bot token".to_string()))
        }
    }

    async fn reply(&self, _activity: &Activity, text: &str) -> Result<(), ClientError> {
        self.replies.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Slack Web API with one public channel and a fixed history.
pub struct FakeSlack {
    pub channels: Vec<SlackChannel>,
    pub history: Vec<SlackMessage>,
    pub members: Vec<String>,
    pub posted: Mutex<Vec<Value>>,
    pub updated: Mutex<Vec<String>>,
    pub responses: Mutex<Vec<String>>,
}

impl Default for FakeSlack {
    fn default() -> Self {
        Self {
            channels: vec![SlackChannel {
                id: "C1".to_string(),
                name: "general".to_string(),
            }],
            history: vec![SlackMessage {
                kind: "message".to_string(),
                ts: "1714521600.000100".to_string(),
                user: Some("U1".to_string()),
                text: "経費精算は月末締めです".to_string(),
                ..SlackMessage::default()
            }],
            members: vec!["U1".to_string(), "UBOT".to_string()],
            posted: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SlackApi for FakeSlack {
    async fn list_public_channels(&self, _token: &str) -> Result<Vec<SlackChannel>, ClientError> {
        Ok(self.channels.clone())
    }

    async fn join_channel(&self, _token: &str, _channel: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn history(
        &self,
        _token: &str,
        _channel: &str,
        _oldest: f64,
        _latest: f64,
    ) -> Result<Vec<SlackMessage>, ClientError> {
        Ok(self.history.clone())
    }

    async fn replies(
        &self,
        _token: &str,
        _channel: &str,
        _thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, ClientError> {
        Ok(Vec::new())
    }

    async fn channel_members(
        &self,
        _token: &str,
        _channel: &str,
    ) -> Result<Vec<String>, ClientError> {
        Ok(self.members.clone())
    }

    async fn user_info(&self, _token: &str, user: &str) -> Result<SlackUser, ClientError> {
        Ok(SlackUser {
            id: user.to_string(),
            name: user.to_lowercase(),
            real_name: Some(format!("User {}", user)),
            is_bot: user == "UBOT",
            deleted: false,
        })
    }

    async fn post_message(&self, _token: &str, payload: Value) -> Result<String, ClientError> {
        self.posted.lock().unwrap().push(payload);
        Ok("1714521700.000200".to_string())
    }

    async fn update_message(
        &self,
        _token: &str,
        _channel: &str,
        _ts: &str,
        text: &str,
    ) -> Result<(), ClientError> {
        self.updated.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn oauth_access(&self, code: &str) -> Result<OAuthAccess, ClientError> {
        if code != "good-code" {
            return Err(ClientError::Slack {
                error: "invalid_code".to_string(),
            });
        }
        Ok(OAuthAccess {
            access_token: "xoxb-test".to_string(),
            team: OAuthTeam {
                id: "T1".to_string(),
                name: Some("Example".to_string()),
            },
            bot_user_id: "UBOT".to_string(),
            scope: "channels:history,chat:write".to_string(),
        })
    }

    async fn post_response_url(&self, _response_url: &str, text: &str) -> Result<(), ClientError> {
        self.responses.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Application state over fakes, with handles to inspect them.
pub struct TestApp {
    pub state: AppState,
    pub identity: Arc<FakeIdentity>,
    pub blob: Arc<FakeBlobStore>,
    pub llm: Arc<FakeLanguageModel>,
    pub search: Arc<FakeVectorIndex>,
    pub bot: Arc<FakeBot>,
    pub slack: Arc<FakeSlack>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let tenants = Arc::new(TenantConnector::from_config(&config));

        let identity = Arc::new(FakeIdentity::default());
        let blob = Arc::new(FakeBlobStore::default());
        let llm = Arc::new(FakeLanguageModel::default());
        let search = Arc::new(FakeVectorIndex::default());
        let bot = Arc::new(FakeBot::default());
        let slack = Arc::new(FakeSlack::default());
        let clients = Clients {
            identity: identity.clone(),
            blob: blob.clone(),
            llm: llm.clone(),
            search: search.clone(),
            bot: bot.clone(),
            slack: slack.clone(),
        };

        let state = AppState::new(Arc::new(config), db, tenants, clients)?;
        Ok(Self {
            state,
            identity,
            blob,
            llm,
            search,
            bot,
            slack,
        })
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone())
    }

    /// Registers a company and returns its id.
    pub async fn company(&self, name: &str) -> Result<Uuid> {
        let server = format!("{}-db", name.to_lowercase().replace(' ', "-"));
        let created = create_company(&self.state.db, &self.state.tenants, name, &server)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e.message))?;
        Ok(created.company_id)
    }

    /// Provisions a user in the company and returns a bearer token for them.
    pub async fn user(&self, company_id: Uuid, role: &str) -> Result<String> {
        let sub = Uuid::new_v4().to_string();
        let (_, db) = self
            .state
            .tenants
            .for_company(&self.state.db, company_id)
            .await?;
        inthub::repositories::CompanyUserRepository::new(&db)
            .create(inthub::repositories::NewCompanyUser {
                company_id,
                email: "taro@example.com".to_string(),
                name: "Taro Yamada".to_string(),
                role: role.to_string(),
                azure_user_id: sub.clone(),
            })
            .await?;

        let token = format!("token-{}", sub);
        self.identity
            .grant(&token, claims(&sub, company_id, role, "taro@example.com"));
        Ok(token)
    }

    pub async fn tenant_db(&self, company_id: Uuid) -> Result<DatabaseConnection> {
        let (_, db) = self
            .state
            .tenants
            .for_company(&self.state.db, company_id)
            .await?;
        Ok(db)
    }
}

pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response: Response<Body> = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body)
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed(method: &str, uri: &str, token: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// `multipart/form-data` body with a single `file` part.
pub fn multipart_upload(uri: &str, file_name: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    let boundary = "inthub-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

pub const SAMPLE_CSV: &str = "Timestamp,User ID,User Name,Channel,Message,Attachments,Parent Message Timestamp\n\
2024-05-01 09:00:00,U1,佐藤,general,経費精算の締め日はいつですか,,\n\
2024-05-01 09:05:00,U2,鈴木,general,毎月25日です,,2024-05-01 09:00:00\n";
