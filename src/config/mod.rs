//! Configuration loading for the Inthub API.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INTHUB_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `INTHUB_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,

    // Master database
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,

    // Tenant databases
    #[serde(default)]
    pub postgres_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_pw: Option<String>,
    #[serde(default = "default_postgres_db")]
    pub postgres_db: String,
    #[serde(default = "default_tenant_database_url_template")]
    pub tenant_database_url_template: String,
    #[serde(default = "default_tenant_pool_cache_size")]
    pub tenant_pool_cache_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,

    #[serde(default)]
    pub b2c: B2cConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

/// Azure AD B2C tenant and API connector credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct B2cConfig {
    pub tenant_id: String,
    pub tenant_name: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub signup_policy: String,
    pub signin_policy: String,
    /// Extension application id; hyphens are stripped when naming claims.
    pub extension_id: String,
    pub basic_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_password: Option<String>,
    /// Overrides `https://{tenant}.b2clogin.com` (tests point this at a mock server).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_base: Option<String>,
    /// Public origin of this API; when set, token exchanges send
    /// `redirect_uri={base}/api/v1/auth/{signup,signin}/callback`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_base: Option<String>,
}

/// Blob storage account used for CSV uploads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StorageConfig {
    pub account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_key: Option<String>,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OpenAiConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_version: String,
    pub chat_deployment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SearchConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
    /// Base name; per-company indexes append `-{company_id}`.
    pub index_name: String,
    pub embedding_deployment: String,
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SlackConfig {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    pub tolerance_seconds: u64,
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TeamsConfig {
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_password: Option<String>,
    /// Bot Framework OpenID metadata document listing the signing keys.
    pub openid_metadata_url: String,
    /// Client-credentials token endpoint for outbound replies.
    pub token_url: String,
}

/// Daily Slack collector schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CollectorConfig {
    pub enabled: bool,
    /// Hour of day (UTC) the collector fires.
    pub hour_utc: u32,
    pub lookback_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            environment: default_environment(),
            api_bind_addr: default_api_bind_addr(),
            worker_threads: default_worker_threads(),
            log_level: default_log_level_for(&default_environment()),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            postgres_user: String::new(),
            postgres_pw: None,
            postgres_db: default_postgres_db(),
            tenant_database_url_template: default_tenant_database_url_template(),
            tenant_pool_cache_size: default_tenant_pool_cache_size(),
            crypto_key: None,
            b2c: B2cConfig::default(),
            storage: StorageConfig::default(),
            openai: OpenAiConfig::default(),
            search: SearchConfig::default(),
            slack: SlackConfig::default(),
            teams: TeamsConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            api_version: default_openai_api_version(),
            chat_deployment: "gpt-4o".to_string(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            admin_key: None,
            index_name: "inthub-index".to_string(),
            embedding_deployment: "text-embedding-ada-002".to_string(),
            api_version: default_search_api_version(),
        }
    }
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            redirect_uri: String::new(),
            signing_secret: None,
            tolerance_seconds: default_slack_tolerance_seconds(),
            api_base: default_slack_api_base(),
        }
    }
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_password: None,
            openid_metadata_url:
                "https://login.botframework.com/v1/.well-known/openidconfiguration".to_string(),
            token_url: "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token"
                .to_string(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hour_utc: 0,
            lookback_days: 1,
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn is_relaxed_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        let redact = |value: &mut Option<String>| {
            if value.is_some() {
                *value = Some(REDACTED.to_string());
            }
        };

        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        redact(&mut config.postgres_pw);
        redact(&mut config.b2c.client_secret);
        redact(&mut config.b2c.basic_password);
        redact(&mut config.storage.account_key);
        redact(&mut config.openai.api_key);
        redact(&mut config.search.admin_key);
        redact(&mut config.slack.client_secret);
        redact(&mut config.slack.signing_secret);
        redact(&mut config.teams.app_password);

        // The master URL embeds credentials.
        if let Ok(mut parsed) = url::Url::parse(&config.database_url) {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some(REDACTED));
                config.database_url = parsed.to_string();
            }
        }

        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    ///
    /// Local and test profiles may run without a crypto key; secret-backed
    /// operations then fail with `CONFIG_ERROR` when first used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.crypto_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
        }

        if self.slack.tolerance_seconds == 0 {
            return Err(ConfigError::InvalidSlackTolerance {
                value: self.slack.tolerance_seconds,
            });
        }

        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidWorkerThreads);
        }

        if self.collector.hour_utc > 23 {
            return Err(ConfigError::InvalidCollectorHour {
                value: self.collector.hour_utc,
            });
        }

        if self.is_relaxed_profile() {
            return Ok(());
        }

        if self.crypto_key.is_none() {
            return Err(ConfigError::MissingCryptoKey);
        }

        let required: [(&str, bool); 10] = [
            ("INTHUB_B2C_TENANT_NAME", !self.b2c.tenant_name.is_empty()),
            ("INTHUB_B2C_CLIENT_ID", !self.b2c.client_id.is_empty()),
            ("INTHUB_B2C_CLIENT_SECRET", self.b2c.client_secret.is_some()),
            ("INTHUB_B2C_BASIC_PW", self.b2c.basic_password.is_some()),
            ("INTHUB_POSTGRES_PW", self.postgres_pw.is_some()),
            ("INTHUB_STORAGE_ACCOUNT_KEY", self.storage.account_key.is_some()),
            ("INTHUB_OPENAI_API_KEY", self.openai.api_key.is_some()),
            ("INTHUB_SEARCH_ADMIN_KEY", self.search.admin_key.is_some()),
            ("INTHUB_SLACK_CLIENT_SECRET", self.slack.client_secret.is_some()),
            ("INTHUB_SLACK_SIGNING_SECRET", self.slack.signing_secret.is_some()),
        ];
        if let Some((name, _)) = required.iter().find(|(_, present)| !present) {
            return Err(ConfigError::MissingSetting {
                name: (*name).to_string(),
                profile: self.profile.clone(),
            });
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_log_level_for(environment: &str) -> String {
    if environment.eq_ignore_ascii_case("production") {
        "info".to_string()
    } else {
        "debug".to_string()
    }
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://dev.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_postgres_db() -> String {
    "postgres".to_string()
}

fn default_tenant_database_url_template() -> String {
    "postgresql://{user}:{password}@{server}.postgres.database.azure.com/{database}?sslmode=require"
        .to_string()
}

fn default_tenant_pool_cache_size() -> usize {
    32
}

fn default_openai_api_version() -> String {
    "2024-02-01".to_string()
}

fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}

fn default_slack_tolerance_seconds() -> u64 {
    300
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("crypto key is missing; set INTHUB_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("{name} is required for profile '{profile}'")]
    MissingSetting { name: String, profile: String },
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: String, value: String },
    #[error("webhook Slack tolerance must be positive, got {value}")]
    InvalidSlackTolerance { value: u64 },
    #[error("worker thread count must be at least 1")]
    InvalidWorkerThreads,
    #[error("collector hour must be between 0 and 23, got {value}")]
    InvalidCollectorHour { value: u32 },
}

/// Loads configuration using layered `.env` files and `INTHUB_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("INTHUB_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut vars = Layered(layered);

        let profile = vars.string("PROFILE").unwrap_or(profile_hint);
        let environment = vars.string("ENVIRONMENT").unwrap_or_else(default_environment);
        let log_level = vars
            .string("LOG_LEVEL")
            .unwrap_or_else(|| default_log_level_for(&environment));

        let crypto_key = match vars.string("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let openai_defaults = OpenAiConfig::default();
        let search_defaults = SearchConfig::default();
        let collector_defaults = CollectorConfig::default();
        let teams_defaults = TeamsConfig::default();

        let config = AppConfig {
            profile,
            environment,
            api_bind_addr: vars
                .string("API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            worker_threads: vars
                .parsed("WORKER_THREADS")?
                .unwrap_or_else(default_worker_threads),
            log_level,
            log_format: vars.string("LOG_FORMAT").unwrap_or_else(default_log_format),
            database_url: vars
                .string("DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: vars
                .parsed("DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: vars
                .parsed("DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            postgres_user: vars.string("POSTGRES_USER").unwrap_or_default(),
            postgres_pw: vars.string("POSTGRES_PW"),
            postgres_db: vars.string("POSTGRES_DB").unwrap_or_else(default_postgres_db),
            tenant_database_url_template: vars
                .string("TENANT_DATABASE_URL_TEMPLATE")
                .unwrap_or_else(default_tenant_database_url_template),
            tenant_pool_cache_size: vars
                .parsed("TENANT_POOL_CACHE_SIZE")?
                .unwrap_or_else(default_tenant_pool_cache_size),
            crypto_key,
            b2c: B2cConfig {
                tenant_id: vars.string("B2C_TENANT_ID").unwrap_or_default(),
                tenant_name: vars.string("B2C_TENANT_NAME").unwrap_or_default(),
                client_id: vars.string("B2C_CLIENT_ID").unwrap_or_default(),
                client_secret: vars.string("B2C_CLIENT_SECRET"),
                signup_policy: vars.string("B2C_SIGNUP_POLICY").unwrap_or_default(),
                signin_policy: vars.string("B2C_SIGNIN_POLICY").unwrap_or_default(),
                extension_id: vars.string("B2C_EXTENSION_ID").unwrap_or_default(),
                basic_user: vars.string("B2C_BASIC_USER").unwrap_or_default(),
                basic_password: vars.string("B2C_BASIC_PW"),
                authority_base: vars.string("B2C_AUTHORITY_BASE"),
                redirect_base: vars.string("B2C_REDIRECT_BASE"),
            },
            storage: StorageConfig {
                account_name: vars.string("STORAGE_ACCOUNT_NAME").unwrap_or_default(),
                account_key: vars.string("STORAGE_ACCOUNT_KEY"),
                container_name: vars.string("STORAGE_CONTAINER_NAME").unwrap_or_default(),
                endpoint: vars.string("STORAGE_ENDPOINT"),
            },
            openai: OpenAiConfig {
                endpoint: vars.string("OPENAI_ENDPOINT").unwrap_or_default(),
                api_key: vars.string("OPENAI_API_KEY"),
                api_version: vars
                    .string("OPENAI_API_VERSION")
                    .unwrap_or(openai_defaults.api_version),
                chat_deployment: vars
                    .string("OPENAI_CHAT_DEPLOYMENT")
                    .unwrap_or(openai_defaults.chat_deployment),
            },
            search: SearchConfig {
                endpoint: vars.string("SEARCH_ENDPOINT").unwrap_or_default(),
                admin_key: vars.string("SEARCH_ADMIN_KEY"),
                index_name: vars
                    .string("SEARCH_INDEX_NAME")
                    .unwrap_or(search_defaults.index_name),
                embedding_deployment: vars
                    .string("SEARCH_EMBEDDING_DEPLOYMENT")
                    .unwrap_or(search_defaults.embedding_deployment),
                api_version: vars
                    .string("SEARCH_API_VERSION")
                    .unwrap_or(search_defaults.api_version),
            },
            slack: SlackConfig {
                client_id: vars.string("SLACK_CLIENT_ID").unwrap_or_default(),
                client_secret: vars.string("SLACK_CLIENT_SECRET"),
                redirect_uri: vars.string("SLACK_REDIRECT_URI").unwrap_or_default(),
                signing_secret: vars.string("SLACK_SIGNING_SECRET"),
                tolerance_seconds: vars
                    .parsed("SLACK_TOLERANCE_SECONDS")?
                    .unwrap_or_else(default_slack_tolerance_seconds),
                api_base: vars
                    .string("SLACK_API_BASE")
                    .unwrap_or_else(default_slack_api_base),
            },
            teams: TeamsConfig {
                app_id: vars.string("MICROSOFT_APP_ID").unwrap_or_default(),
                app_password: vars.string("MICROSOFT_APP_PASSWORD"),
                openid_metadata_url: vars
                    .string("TEAMS_OPENID_METADATA_URL")
                    .unwrap_or(teams_defaults.openid_metadata_url),
                token_url: vars
                    .string("TEAMS_TOKEN_URL")
                    .unwrap_or(teams_defaults.token_url),
            },
            collector: CollectorConfig {
                enabled: vars
                    .parsed("COLLECTOR_ENABLED")?
                    .unwrap_or(collector_defaults.enabled),
                hour_utc: vars
                    .parsed("COLLECTOR_HOUR_UTC")?
                    .unwrap_or(collector_defaults.hour_utc),
                lookback_days: vars
                    .parsed("COLLECTOR_LOOKBACK_DAYS")?
                    .unwrap_or(collector_defaults.lookback_days),
            },
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("INTHUB_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("INTHUB_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix-stripped key/value pairs still waiting to be consumed.
struct Layered(BTreeMap<String, String>);

impl Layered {
    /// Removes a key, treating blank values as unset.
    fn string(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    name: format!("INTHUB_{}", key),
                    value: raw,
                }),
            None => Ok(None),
        }
    }
}
