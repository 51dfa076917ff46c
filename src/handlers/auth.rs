//! Identity provider callbacks, token refresh and the current-user lookup.

use axum::{
    Json,
    extract::State,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::extract::{ApiJson, ApiQuery};
use crate::auth::CurrentUser;
use crate::clients::{IdTokenClaims, Policy, TokenSet};
use crate::error::{ApiError, ErrorCode, invalid_request};
use crate::server::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    /// Authorization code issued by the identity provider
    pub code: String,
}

/// User attributes read from a verified id token.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SignupResponse {
    #[schema(example = "Hanako Yamada")]
    pub name: String,
    pub company_id: String,
    #[schema(example = "hanako@example.com")]
    pub email: String,
    pub azure_user_id: String,
    #[schema(example = "member")]
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SigninResponse {
    #[serde(flatten)]
    pub user: SignupResponse,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub name: String,
    pub company_id: String,
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshTokenRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefreshTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
}

fn required_claim(value: Option<String>, claim: &str) -> Result<String, ApiError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        ApiError::new(
            ErrorCode::InvalidToken,
            format!("Token is missing the {} claim", claim),
        )
    })
}

impl TryFrom<IdTokenClaims> for SignupResponse {
    type Error = ApiError;

    fn try_from(claims: IdTokenClaims) -> Result<Self, Self::Error> {
        Ok(Self {
            email: required_claim(claims.emails.into_iter().next(), "emails")?,
            name: required_claim(claims.name, "name")?,
            azure_user_id: required_claim(claims.sub, "sub")?,
            company_id: required_claim(claims.company_id, "extension_companyId")?,
            role: required_claim(claims.role, "extension_role")?,
        })
    }
}

async fn verified_user(
    state: &AppState,
    policy: Policy,
    tokens: &TokenSet,
) -> Result<SignupResponse, ApiError> {
    let id_token = tokens
        .id_token
        .as_deref()
        .ok_or_else(|| invalid_request("ID token is not valid"))?;
    let claims = state.identity.verify_token(policy, id_token).await?;
    SignupResponse::try_from(claims)
}

/// Sign-up user flow callback
#[utoipa::path(
    get,
    path = "/api/v1/auth/signup/callback",
    params(CallbackQuery),
    responses(
        (status = 200, description = "User attributes from the id token", body = SignupResponse),
        (status = 401, description = "Token verification failed", body = ApiError)
    ),
    tag = "auth"
)]
pub async fn signup_callback(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CallbackQuery>,
) -> Result<Json<SignupResponse>, ApiError> {
    tracing::info!("Starting signup callback process");
    let tokens = state.identity.exchange_code(Policy::SignUp, &query.code).await?;
    let user = verified_user(&state, Policy::SignUp, &tokens).await?;
    tracing::info!(azure_user_id = %user.azure_user_id, "Signup callback completed");
    Ok(Json(user))
}

/// Sign-in user flow callback
#[utoipa::path(
    get,
    path = "/api/v1/auth/signin/callback",
    params(CallbackQuery),
    responses(
        (status = 200, description = "User attributes and tokens", body = SigninResponse),
        (status = 401, description = "Token verification failed", body = ApiError)
    ),
    tag = "auth"
)]
pub async fn signin_callback(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CallbackQuery>,
) -> Result<Json<SigninResponse>, ApiError> {
    tracing::info!("Starting signin callback process");
    let tokens = state.identity.exchange_code(Policy::SignIn, &query.code).await?;
    let user = verified_user(&state, Policy::SignIn, &tokens).await?;
    tracing::info!(azure_user_id = %user.azure_user_id, "Signin callback completed");
    Ok(Json(SigninResponse {
        user,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    }))
}

/// The signed-in user
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current user", body = MeResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn me(user: CurrentUser) -> Json<MeResponse> {
    Json(MeResponse {
        name: user.name,
        company_id: user.company_id.to_string(),
        user_id: user.user_id.to_string(),
        role: user.role,
    })
}

/// Exchanges a refresh token for a new token set
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh-token",
    request_body = RefreshTokenRequest,
    responses(
        (status = 200, description = "New tokens", body = RefreshTokenResponse),
        (status = 400, description = "Missing refresh token or incomplete response", body = ApiError)
    ),
    tag = "auth"
)]
pub async fn refresh_token(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RefreshTokenRequest>,
) -> Result<Json<RefreshTokenResponse>, ApiError> {
    let refresh_token = request
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid_request("refresh_token is required"))?;

    let tokens = state.identity.refresh_token(&refresh_token).await?;
    match (tokens.access_token, tokens.refresh_token, tokens.id_token) {
        (Some(access_token), Some(refresh_token), Some(id_token)) => Ok(Json(RefreshTokenResponse {
            access_token,
            refresh_token,
            id_token,
        })),
        _ => Err(invalid_request("Invalid token response")),
    }
}
