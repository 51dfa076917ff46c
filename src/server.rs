//! # Server Configuration
//!
//! Shared application state, the `/api/v1` router tree and the OpenAPI
//! document.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, patch, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{Http, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::basic_auth_middleware;
use crate::clients::{
    AzureBlobStore, AzureOpenAi, AzureSearch, B2cClient, BlobStore, BotConnector,
    BotFrameworkClient, IdentityProvider, LanguageModel, SlackApi, SlackClient, VectorIndex,
    build_http_client,
};
use crate::config::AppConfig;
use crate::crypto::{CryptoError, CryptoKey};
use crate::db::TenantConnector;
use crate::handlers;
use crate::services::rag::RagService;
use crate::services::slack::SlackService;
use crate::telemetry::request_context;
use crate::webhook_verification::slack_signature_middleware;

/// Upload routes accept bodies above the 10 MiB file limit so the size check
/// can answer with PAYLOAD_TOO_LARGE.
const UPLOAD_BODY_LIMIT: usize = 20 * 1024 * 1024;

/// Upstream service clients, behind their traits.
#[derive(Clone)]
pub struct Clients {
    pub identity: Arc<dyn IdentityProvider>,
    pub blob: Arc<dyn BlobStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub search: Arc<dyn VectorIndex>,
    pub bot: Arc<dyn BotConnector>,
    pub slack: Arc<dyn SlackApi>,
}

impl Clients {
    /// reqwest-backed clients sharing one connection pool.
    pub fn from_config(config: &AppConfig) -> Self {
        let http = build_http_client();
        Self {
            identity: Arc::new(B2cClient::new(http.clone(), config.b2c.clone())),
            blob: Arc::new(AzureBlobStore::new(http.clone(), config.storage.clone())),
            llm: Arc::new(AzureOpenAi::new(
                http.clone(),
                config.openai.clone(),
                config.search.embedding_deployment.clone(),
            )),
            search: Arc::new(AzureSearch::new(http.clone(), config.search.clone())),
            bot: Arc::new(BotFrameworkClient::new(http.clone(), config.teams.clone())),
            slack: Arc::new(SlackClient::new(http, config.slack.clone())),
        }
    }
}

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Master registry database
    pub db: DatabaseConnection,
    pub tenants: Arc<TenantConnector>,
    pub identity: Arc<dyn IdentityProvider>,
    pub blob: Arc<dyn BlobStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub search: Arc<dyn VectorIndex>,
    pub bot: Arc<dyn BotConnector>,
    pub rag: Arc<RagService>,
    pub slack: Arc<SlackService>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        tenants: Arc<TenantConnector>,
        clients: Clients,
    ) -> Result<Self, CryptoError> {
        let crypto_key = config.crypto_key.clone().map(CryptoKey::new).transpose()?;
        if crypto_key.is_none() {
            tracing::warn!("INTHUB_CRYPTO_KEY is not set; Slack installs and bot tokens are unavailable");
        }

        let rag = Arc::new(RagService::new(
            Arc::clone(&clients.llm),
            Arc::clone(&clients.search),
            Arc::clone(&clients.blob),
            config.search.index_name.clone(),
        ));
        let slack = Arc::new(SlackService::new(
            db.clone(),
            Arc::clone(&tenants),
            crypto_key,
            clients.slack,
            Arc::clone(&rag),
            Arc::clone(&clients.blob),
            config.slack.clone(),
        ));

        Ok(Self {
            config,
            db,
            tenants,
            identity: clients.identity,
            blob: clients.blob,
            llm: clients.llm,
            search: clients.search,
            bot: clients.bot,
            rag,
            slack,
        })
    }
}

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/signup/callback", get(handlers::auth::signup_callback))
        .route("/signin/callback", get(handlers::auth::signin_callback))
        .route("/me", get(handlers::auth::me))
        .route("/refresh-token", post(handlers::auth::refresh_token))
}

fn company_routes() -> Router<AppState> {
    use handlers::company::*;

    Router::new()
        .route("/", post(create_company).get(list_companies))
        .route("/list/slack-workspaces", get(list_slack_workspaces))
        .route("/{company_id}", get(get_company))
        .route("/{company_id}/senpai", post(register_senpai).get(list_senpais))
        .route("/{company_id}/senpai/{senpai_id}", get(get_senpai))
        .route("/{company_id}/data/upload", post(upload_data))
        .route("/{company_id}/data/restore", post(restore_data))
        .route("/{company_id}/data/status/{file_id}", get(file_status))
        .route("/{company_id}/data/delete", delete(delete_data))
        .route(
            "/{company_id}/rag/prompt",
            get(get_prompt).put(update_prompt).delete(reset_prompt),
        )
        .route("/{company_id}/invite-codes", post(create_invite_code))
        .route(
            "/{company_id}/allowed-domains",
            patch(update_allowed_domains).get(get_allowed_domains),
        )
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
}

fn internal_routes(config: Arc<AppConfig>) -> Router<AppState> {
    Router::new()
        .route("/b2c/verify-invite", post(handlers::internal::verify_invite))
        .route("/b2c/user-provision", post(handlers::internal::user_provision))
        .layer(from_fn_with_state(config, basic_auth_middleware))
}

fn chat_routes() -> Router<AppState> {
    use handlers::chat::*;

    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/end", post(end_session))
        .route("/messages", post(send_message).get(list_messages))
}

fn rag_routes() -> Router<AppState> {
    use handlers::rag::*;

    Router::new()
        .route("/build-index", post(build_index))
        .route("/build-index-from-blob", post(build_index_from_blob))
        .route("/delete-index", delete(delete_index))
        .route("/query", post(query))
        .route("/index/documents", get(list_index_documents))
        .route("/files/{company_id}", get(list_files))
        .route("/documents/{document_id}", delete(delete_document))
        .route("/prompt", post(post_prompt))
        .route(
            "/prompt/{company_id}",
            get(get_prompt).put(set_prompt).delete(reset_prompt),
        )
}

fn meeting_routes() -> Router<AppState> {
    Router::new()
        .route("/{company_id}/upload", post(handlers::meeting::upload_meeting))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
}

fn slack_routes(config: Arc<AppConfig>) -> Router<AppState> {
    use handlers::slack::*;

    let signed = Router::new()
        .route("/events", post(events))
        .route("/interactivity", post(interactivity))
        .route("/commands", post(commands))
        .layer(from_fn_with_state(config, slack_signature_middleware));

    Router::new()
        .route("/fetch", post(fetch))
        .route("/authorize-url", get(authorize_url))
        .route("/install", get(install))
        .merge(signed)
}

fn system_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::system::health))
        .route("/test", get(handlers::system::test))
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .nest("/auth", auth_routes())
        .nest("/company", company_routes())
        .nest("/internal", internal_routes(Arc::clone(&state.config)))
        .nest("/chat", chat_routes())
        .nest("/rag", rag_routes())
        .nest("/meeting", meeting_routes())
        .nest("/slack", slack_routes(Arc::clone(&state.config)))
        .route("/teams/messages", post(handlers::teams::messages))
        .nest("/system", system_routes());

    Router::new()
        .route("/", get(handlers::system::root))
        .nest("/api/v1", api)
        .layer(from_fn(request_context))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Serves the API until `shutdown` is cancelled.
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .with_context(|| format!("invalid bind address {:?}", state.config.api_bind_addr))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, profile = %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server terminated with an error")?;

    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
        components.add_security_scheme(
            "basic_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Basic)),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::system::root,
        crate::handlers::system::health,
        crate::handlers::system::test,
        crate::handlers::auth::signup_callback,
        crate::handlers::auth::signin_callback,
        crate::handlers::auth::me,
        crate::handlers::auth::refresh_token,
        crate::handlers::company::create_company,
        crate::handlers::company::list_companies,
        crate::handlers::company::get_company,
        crate::handlers::company::register_senpai,
        crate::handlers::company::list_senpais,
        crate::handlers::company::get_senpai,
        crate::handlers::company::upload_data,
        crate::handlers::company::restore_data,
        crate::handlers::company::file_status,
        crate::handlers::company::delete_data,
        crate::handlers::company::get_prompt,
        crate::handlers::company::update_prompt,
        crate::handlers::company::reset_prompt,
        crate::handlers::company::create_invite_code,
        crate::handlers::company::update_allowed_domains,
        crate::handlers::company::get_allowed_domains,
        crate::handlers::company::list_slack_workspaces,
        crate::handlers::internal::verify_invite,
        crate::handlers::internal::user_provision,
        crate::handlers::chat::create_session,
        crate::handlers::chat::send_message,
        crate::handlers::chat::end_session,
        crate::handlers::chat::list_sessions,
        crate::handlers::chat::list_messages,
        crate::handlers::rag::build_index,
        crate::handlers::rag::build_index_from_blob,
        crate::handlers::rag::delete_index,
        crate::handlers::rag::query,
        crate::handlers::rag::list_index_documents,
        crate::handlers::rag::list_files,
        crate::handlers::rag::delete_document,
        crate::handlers::rag::get_prompt,
        crate::handlers::rag::post_prompt,
        crate::handlers::rag::set_prompt,
        crate::handlers::rag::reset_prompt,
        crate::handlers::meeting::upload_meeting,
        crate::handlers::slack::events,
        crate::handlers::slack::interactivity,
        crate::handlers::slack::commands,
        crate::handlers::slack::fetch,
        crate::handlers::slack::authorize_url,
        crate::handlers::slack::install,
        crate::handlers::teams::messages,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::handlers::StatusMessage,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Sign-up, sign-in and tokens"),
        (name = "company", description = "Tenants, data files and settings"),
        (name = "internal", description = "Identity provider API connector"),
        (name = "chat", description = "Knowledge-base chat"),
        (name = "rag", description = "Vector index and retrieval"),
        (name = "meeting", description = "Meeting transcripts"),
        (name = "slack", description = "Slack app"),
        (name = "teams", description = "Teams bot"),
        (name = "system", description = "Health"),
    ),
    info(
        title = "InterHub API",
        description = "Multi-tenant knowledge base fed by Slack, Teams and uploaded conversations",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
