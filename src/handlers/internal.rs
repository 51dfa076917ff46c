//! API connector endpoints called by the identity provider during sign-up.
//!
//! Claims arrive as a flat JSON object whose custom attributes are named
//! `extension_{extension id without hyphens}_{attribute}`.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse, response::Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use super::extract::ApiJson;
use crate::config::B2cConfig;
use crate::error::{ApiError, invalid_request};
use crate::repositories::NewCompanyUser;
use crate::server::AppState;
use crate::services::company as company_service;

const CONNECTOR_VERSION: &str = "1.0.0";

/// Claims posted by the API connector.
pub type ConnectorClaims = Map<String, Value>;

/// `Continue` or `ValidationError` answer understood by the identity provider.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorResponse {
    #[schema(example = "1.0.0")]
    pub version: String,
    pub status: u16,
    /// `Continue` or `ValidationError`
    pub action: String,
    #[serde(rename = "extension_inviteCode", skip_serializing_if = "Option::is_none")]
    pub extension_invite_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

impl ConnectorResponse {
    fn proceed(invite_code: Option<String>) -> Self {
        Self {
            version: CONNECTOR_VERSION.to_string(),
            status: 200,
            action: "Continue".to_string(),
            extension_invite_code: invite_code,
            user_message: None,
        }
    }

    fn reject(message: impl Into<String>) -> Self {
        Self {
            version: CONNECTOR_VERSION.to_string(),
            status: 400,
            action: "ValidationError".to_string(),
            extension_invite_code: None,
            user_message: Some(message.into()),
        }
    }
}

impl IntoResponse for ConnectorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_REQUEST);
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProvisionResponse {
    pub version: String,
    pub status: String,
}

/// Name of a custom attribute claim.
pub fn extension_claim(config: &B2cConfig, attribute: &str) -> String {
    format!("extension_{}_{}", config.extension_id.replace('-', ""), attribute)
}

fn claim<'a>(claims: &'a ConnectorClaims, name: &str) -> Option<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Admits or rejects a sign-up by e-mail domain or invite code
#[utoipa::path(
    post,
    path = "/api/v1/internal/b2c/verify-invite",
    request_body(content = Object, description = "API connector claims"),
    responses(
        (status = 200, description = "Sign-up may continue", body = ConnectorResponse),
        (status = 400, description = "Sign-up rejected", body = ConnectorResponse),
        (status = 401, description = "Bad connector credentials", body = ApiError)
    ),
    security(("basic_auth" = [])),
    tag = "internal"
)]
pub async fn verify_invite(
    State(state): State<AppState>,
    ApiJson(claims): ApiJson<ConnectorClaims>,
) -> ConnectorResponse {
    let b2c = &state.config.b2c;
    let email = claim(&claims, "email").unwrap_or_default();
    let invite_code = claim(&claims, &extension_claim(b2c, "inviteCode")).map(str::to_string);
    tracing::info!("Starting invite verification");

    let Some(company_id) = claim(&claims, &extension_claim(b2c, "companyId")) else {
        tracing::warn!("Company ID not found in claims");
        return ConnectorResponse::reject("会社IDが見つかりません");
    };
    let Ok(company_id) = Uuid::parse_str(company_id) else {
        return ConnectorResponse::reject("会社IDが見つかりません");
    };

    match company_service::verify_invite(&state.db, company_id, email, invite_code.as_deref())
        .await
    {
        Ok(()) => {
            tracing::info!(%company_id, "Invite verification successful");
            ConnectorResponse::proceed(invite_code)
        }
        Err(e) => {
            tracing::warn!(%company_id, error = %e, "Invite verification failed");
            ConnectorResponse::reject(e.message.to_string())
        }
    }
}

/// Creates the tenant user row after the identity provider created the account
#[utoipa::path(
    post,
    path = "/api/v1/internal/b2c/user-provision",
    request_body(content = Object, description = "API connector claims"),
    responses(
        (status = 200, description = "User provisioned", body = ProvisionResponse),
        (status = 409, description = "User already exists", body = ApiError)
    ),
    security(("basic_auth" = [])),
    tag = "internal"
)]
pub async fn user_provision(
    State(state): State<AppState>,
    ApiJson(claims): ApiJson<ConnectorClaims>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    tracing::info!("Starting user provision");
    let b2c = &state.config.b2c;
    let required = |name: &str| {
        claim(&claims, name)
            .map(str::to_string)
            .ok_or_else(|| invalid_request(format!("Missing claim: {}", name)))
    };

    let company_claim = extension_claim(b2c, "companyId");
    let company_id = Uuid::parse_str(&required(&company_claim)?)
        .map_err(|_| invalid_request(format!("Invalid claim: {}", company_claim)))?;
    let user = NewCompanyUser {
        company_id,
        azure_user_id: required("objectId")?,
        email: required("email")?,
        name: required("displayName")?,
        role: required(&extension_claim(b2c, "role"))?,
    };

    let created = company_service::provision_user(&state.db, &state.tenants, user).await?;
    tracing::info!(%company_id, user_id = %created.id, "User provisioned");
    Ok(Json(ProvisionResponse {
        version: CONNECTOR_VERSION.to_string(),
        status: "ok".to_string(),
    }))
}
