//! Database migrations for the Inthub API.
//!
//! Two independent schema sets are carried here:
//! [`Migrator`] for the shared master database and [`TenantMigrator`] for the
//! per-company tenant databases.

pub use sea_orm_migration::prelude::*;

mod m2024_01_01_000001_create_tenants;
mod m2024_01_01_000002_create_invitation_tokens;
mod m2024_01_01_000003_create_slack_install_states;
mod m2024_01_01_000004_create_slack_workspaces;
mod m2024_01_01_000005_create_secrets;

mod m2024_02_01_000001_create_companies;
mod m2024_02_01_000002_create_company_users;
mod m2024_02_01_000003_create_senpais;
mod m2024_02_01_000004_create_chat_rooms;
mod m2024_02_01_000005_create_chat_messages;
mod m2024_02_01_000006_create_csv_files;

/// Master schema: tenant registry, invitations, Slack installs and secrets.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_01_01_000001_create_tenants::Migration),
            Box::new(m2024_01_01_000002_create_invitation_tokens::Migration),
            Box::new(m2024_01_01_000003_create_slack_install_states::Migration),
            Box::new(m2024_01_01_000004_create_slack_workspaces::Migration),
            Box::new(m2024_01_01_000005_create_secrets::Migration),
        ]
    }
}

/// Tenant schema, applied to each company database on creation.
pub struct TenantMigrator;

#[async_trait::async_trait]
impl MigratorTrait for TenantMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_02_01_000001_create_companies::Migration),
            Box::new(m2024_02_01_000002_create_company_users::Migration),
            Box::new(m2024_02_01_000003_create_senpais::Migration),
            Box::new(m2024_02_01_000004_create_chat_rooms::Migration),
            Box::new(m2024_02_01_000005_create_chat_messages::Migration),
            Box::new(m2024_02_01_000006_create_csv_files::Migration),
        ]
    }
}
