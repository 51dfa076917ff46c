//! # CSV File Model
//!
//! Source files uploaded to blob storage and (once processed) indexed for
//! retrieval. `status` moves from `uploaded` to `indexed`, and back to
//! `uploaded` when the company index is dropped.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_UPLOADED: &str = "uploaded";
pub const STATUS_INDEXED: &str = "indexed";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "csv_files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub file_name: String,
    /// Size in bytes
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
    #[sea_orm(column_type = "Text")]
    pub blob_url: String,
    pub status: String,
    pub company_id: Uuid,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
