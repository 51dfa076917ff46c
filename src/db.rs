//! Database connection management.
//!
//! The master database holds the tenant registry and is opened once at start
//! up with [`init_pool`]. Each company has its own tenant database; those
//! pools are opened lazily by [`TenantConnector`] and kept in an LRU cache
//! keyed by the tenant's server name.

use std::num::NonZeroUsize;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use migration::{MigratorTrait, TenantMigrator};
use regex::Regex;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::master::tenant;
use crate::repositories::TenantRepository;

const CONNECT_ATTEMPTS: u32 = 5;

static SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("valid regex"));

/// Whether `server` is usable as a tenant server name: lowercase
/// alphanumerics and hyphens, at most 63 characters, not starting with `-`.
pub fn is_valid_server_name(server: &str) -> bool {
    SERVER_NAME.is_match(server)
}

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Database connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("No tenant registered for company {0}")]
    UnknownCompany(Uuid),
    #[error("Invalid tenant server name: {0:?}")]
    InvalidServerName(String),
    #[error("Tenant schema migration failed for {server}: {source}")]
    MigrationFailed {
        server: String,
        source: sea_orm::DbErr,
    },
}

/// Opens the master database pool, retrying transient failures.
///
/// ```no_run
/// use inthub::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::default();
///     let db = init_pool(&config).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    let opt = connect_options(
        &cfg.database_url,
        cfg.db_max_connections,
        cfg.db_acquire_timeout_ms,
    );
    Ok(connect_with_retry(opt, cfg.db_acquire_timeout_ms).await?)
}

fn connect_options(url: &str, max_connections: u32, acquire_timeout_ms: u64) -> ConnectOptions {
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    // Every in-memory SQLite connection is its own database.
    if url.contains(":memory:") {
        opt.max_connections(1).min_connections(1);
    }
    opt
}

async fn connect_with_retry(
    opt: ConnectOptions,
    timeout_ms: u64,
) -> Result<DatabaseConnection, DatabaseError> {
    let mut retry_delay = Duration::from_millis(100);

    for attempt in 1..=CONNECT_ATTEMPTS {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("Successfully connected to database (attempt {})", attempt);
                return Ok(conn);
            }
            Err(e) if attempt == CONNECT_ATTEMPTS => {
                log::error!(
                    "Failed to connect to database after {} attempts: {}",
                    CONNECT_ATTEMPTS,
                    e
                );
                return Err(DatabaseError::ConnectionFailed { source: e });
            }
            Err(e) => {
                log::warn!(
                    "Database connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    retry_delay
                );
                sleep(retry_delay).await;
                retry_delay *= 2;
            }
        }
    }

    Err(DatabaseError::ConnectionTimeout { timeout_ms })
}

/// Runs `SELECT 1` against the connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("Database health check failed")?;
    Ok(())
}

/// Resolves and caches per-company tenant database pools.
pub struct TenantConnector {
    template: String,
    user: String,
    password: String,
    database: String,
    max_connections: u32,
    acquire_timeout_ms: u64,
    pools: Mutex<LruCache<String, DatabaseConnection>>,
}

impl TenantConnector {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let capacity =
            NonZeroUsize::new(cfg.tenant_pool_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            template: cfg.tenant_database_url_template.clone(),
            user: cfg.postgres_user.clone(),
            password: cfg.postgres_pw.clone().unwrap_or_default(),
            database: cfg.postgres_db.clone(),
            max_connections: cfg.db_max_connections,
            acquire_timeout_ms: cfg.db_acquire_timeout_ms,
            pools: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Builds the connection URL for `server` from the template.
    ///
    /// `{user}` and `{password}` are set through [`Url`] so reserved
    /// characters in credentials are percent-encoded.
    pub fn tenant_url(&self, server: &str) -> Result<String, DatabaseError> {
        if !is_valid_server_name(server) {
            return Err(DatabaseError::InvalidServerName(server.to_string()));
        }
        let raw = self
            .template
            .replace("{server}", server)
            .replace("{database}", &self.database);
        if !raw.contains("{user}") && !raw.contains("{password}") {
            return Ok(raw);
        }

        let invalid = |message: String| DatabaseError::InvalidConfiguration { message };
        let mut url = Url::parse(&raw.replace("{user}", "u").replace("{password}", "p"))
            .map_err(|e| invalid(format!("tenant database URL template: {}", e)))?;
        url.set_username(&self.user)
            .map_err(|_| invalid("tenant database URL cannot carry a user".to_string()))?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid("tenant database URL cannot carry a password".to_string()))?;
        Ok(url.to_string())
    }

    /// Adds an already open pool for `server`.
    pub async fn register(&self, server: &str, conn: DatabaseConnection) {
        self.pools.lock().await.put(server.to_string(), conn);
    }

    /// Returns the pool for `server`, opening it on first use.
    pub async fn connect(&self, server: &str) -> Result<DatabaseConnection, DatabaseError> {
        if let Some(conn) = self.pools.lock().await.get(server) {
            return Ok(conn.clone());
        }

        let url = self.tenant_url(server)?;
        tracing::info!(server, "Opening tenant database pool");
        let opt = connect_options(&url, self.max_connections, self.acquire_timeout_ms);
        let conn = connect_with_retry(opt, self.acquire_timeout_ms).await?;

        let mut pools = self.pools.lock().await;
        if let Some(existing) = pools.get(server) {
            return Ok(existing.clone());
        }
        pools.put(server.to_string(), conn.clone());
        Ok(conn)
    }

    /// Looks the company up in the master registry and returns its tenant pool.
    pub async fn for_company(
        &self,
        master: &DatabaseConnection,
        company_id: Uuid,
    ) -> Result<(tenant::Model, DatabaseConnection), DatabaseError> {
        let tenant = TenantRepository::new(master)
            .find_by_company_id(company_id)
            .await?
            .ok_or(DatabaseError::UnknownCompany(company_id))?;
        let conn = self.connect(&tenant.company_server_name).await?;
        Ok((tenant, conn))
    }

    /// Applies the tenant schema to `server`'s database and returns the pool.
    pub async fn initialize(&self, server: &str) -> Result<DatabaseConnection, DatabaseError> {
        let conn = self.connect(server).await?;
        TenantMigrator::up(&conn, None)
            .await
            .map_err(|source| DatabaseError::MigrationFailed {
                server: server.to_string(),
                source,
            })?;
        tracing::info!(server, "Tenant schema is up to date");
        Ok(conn)
    }

    /// Server names with an open pool, most recently used first.
    pub async fn cached_servers(&self) -> Vec<String> {
        self.pools
            .lock()
            .await
            .iter()
            .map(|(server, _)| server.clone())
            .collect()
    }
}
