//! Shared fixtures for unit tests.

use migration::{Migrator, MigratorTrait, TenantMigrator};
use sea_orm::{Database, DatabaseConnection};

use crate::crypto::CryptoKey;

/// In-memory master database with the master schema applied.
pub async fn master_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

/// In-memory tenant database with the tenant schema applied.
pub async fn tenant_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    TenantMigrator::up(&db, None).await.unwrap();
    db
}

pub fn test_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).unwrap()
}
