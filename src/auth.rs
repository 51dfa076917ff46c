//! # Authentication and Authorization
//!
//! Two schemes protect the API:
//!
//! - end users send the B2C access token as `Authorization: Bearer`; the
//!   [`CurrentUser`] extractor verifies it and loads the tenant user row;
//! - the B2C API connector calls `/internal` with HTTP Basic credentials,
//!   checked by [`basic_auth_middleware`].

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header::AUTHORIZATION, header::WWW_AUTHENTICATE, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clients::Policy;
use crate::config::{AppConfig, B2cConfig};
use crate::error::{ApiError, ErrorCode, not_found, unauthorized};
use crate::repositories::CompanyUserRepository;
use crate::server::AppState;

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// The signed-in user behind a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CurrentUser {
    pub user_id: Uuid,
    pub name: String,
    pub company_id: Uuid,
    pub role: String,
}

/// Token from an `Authorization: Bearer` header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)?;
        let claims = state.identity.verify_token(Policy::SignIn, token).await?;

        let azure_user_id = claims
            .sub
            .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken, "Token has no subject"))?;
        let company_id = claims
            .company_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken, "Token has no company id"))?;

        let (_, tenant_db) = state.tenants.for_company(&state.db, company_id).await?;
        let user = CompanyUserRepository::new(&tenant_db)
            .find_by_azure_id(&azure_user_id)
            .await?
            .ok_or_else(|| not_found("User not found"))?;

        tracing::debug!(user_id = %user.id, %company_id, "Authenticated user");
        Ok(CurrentUser {
            user_id: user.id,
            name: user.name,
            company_id: user.company_id,
            role: user.role,
        })
    }
}

/// `(user, password)` from an `Authorization: Basic` header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn credentials_match(config: &B2cConfig, user: &str, password: &str) -> bool {
    let Some(expected_password) = config.basic_password.as_deref() else {
        return false;
    };
    if config.basic_user.is_empty() {
        return false;
    }
    let user_ok = user.as_bytes().ct_eq(config.basic_user.as_bytes());
    let password_ok = password.as_bytes().ct_eq(expected_password.as_bytes());
    (user_ok & password_ok).into()
}

fn basic_challenge() -> Response {
    let mut response = unauthorized(Some("Invalid credentials")).into_response();
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}

/// HTTP Basic check for the identity provider's API connector calls.
pub async fn basic_auth_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Response {
    match basic_credentials(request.headers()) {
        Some((user, password)) if credentials_match(&config.b2c, &user, &password) => {
            next.run(request).await
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "Rejected API connector credentials");
            basic_challenge()
        }
    }
}
