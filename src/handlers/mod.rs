//! # API Handlers
//!
//! HTTP handlers for every `/api/v1` router. Handlers stay thin: they parse
//! the request, resolve the tenant database and delegate to `services`.

use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;

pub mod auth;
pub mod chat;
pub mod company;
pub mod extract;
pub mod internal;
pub mod meeting;
pub mod rag;
pub mod slack;
pub mod system;
pub mod teams;

/// `{status, message}` acknowledgement used by most mutating endpoints.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusMessage {
    /// Always `success`
    #[schema(example = "success")]
    pub status: String,
    pub message: String,
}

impl StatusMessage {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}

/// Connection to the tenant database holding `company_id`.
pub(crate) async fn tenant_db(
    state: &AppState,
    company_id: Uuid,
) -> Result<DatabaseConnection, ApiError> {
    let (_, db) = state.tenants.for_company(&state.db, company_id).await?;
    Ok(db)
}
