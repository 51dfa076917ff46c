//! Tenant registry entity.
//!
//! Maps a company to the database server that holds its tenant schema, and
//! carries the e-mail domains allowed to self-register without an invite code.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::StringList;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub company_name: String,

    /// Identifier of the `companies` row inside the tenant database
    #[sea_orm(unique)]
    pub company_id: Uuid,

    /// Database server name, substituted into the tenant URL template
    #[sea_orm(unique)]
    pub company_server_name: String,

    /// Domains such as `@example.com`
    #[sea_orm(column_type = "Json")]
    pub allowed_domains: StringList,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
