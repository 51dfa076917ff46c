//! Azure AD B2C authorization-code and refresh-token flows.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use reqwest::Client;
use serde::Deserialize;

use super::jwks::{JwksVerifier, KeySource};
use super::{ClientError, check_status, trim_base};
use crate::config::B2cConfig;

const SERVICE: &str = "azure-b2c";

/// User flow a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    SignUp,
    SignIn,
}

impl Policy {
    /// Path segment used in callback URLs.
    pub fn callback_segment(&self) -> &'static str {
        match self {
            Policy::SignUp => "signup",
            Policy::SignIn => "signin",
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Claims read from B2C id and access tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub emails: Vec<String>,
    pub name: Option<String>,
    pub sub: Option<String>,
    #[serde(rename = "extension_companyId")]
    pub company_id: Option<String>,
    #[serde(rename = "extension_role")]
    pub role: Option<String>,
}

/// Identity provider operations needed by the auth endpoints.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_code(&self, policy: Policy, code: &str) -> Result<TokenSet, ClientError>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ClientError>;
    async fn verify_token(&self, policy: Policy, token: &str)
    -> Result<IdTokenClaims, ClientError>;
}

/// reqwest-backed [`IdentityProvider`].
pub struct B2cClient {
    http: Client,
    config: B2cConfig,
    signup_keys: JwksVerifier,
    signin_keys: JwksVerifier,
}

impl B2cClient {
    pub fn new(http: Client, config: B2cConfig) -> Self {
        let keys_url = |policy: &str| {
            format!(
                "{}/{}.onmicrosoft.com/{}/discovery/v2.0/keys",
                authority(&config),
                config.tenant_name,
                policy
            )
        };
        let signup_keys = JwksVerifier::new(
            http.clone(),
            KeySource::Direct(keys_url(&config.signup_policy)),
        );
        let signin_keys = JwksVerifier::new(
            http.clone(),
            KeySource::Direct(keys_url(&config.signin_policy)),
        );
        Self {
            http,
            config,
            signup_keys,
            signin_keys,
        }
    }

    fn policy_name(&self, policy: Policy) -> &str {
        match policy {
            Policy::SignUp => &self.config.signup_policy,
            Policy::SignIn => &self.config.signin_policy,
        }
    }

    fn token_url(&self, policy: Policy) -> String {
        format!(
            "{}/{}.onmicrosoft.com/{}/oauth2/v2.0/token",
            authority(&self.config),
            self.config.tenant_name,
            self.policy_name(policy)
        )
    }

    fn scope(&self) -> String {
        format!(
            "openid offline_access https://{}.onmicrosoft.com/{}/read",
            self.config.tenant_name, self.config.client_id
        )
    }

    fn redirect_uri(&self, policy: Policy) -> Option<String> {
        self.config.redirect_base.as_deref().map(|base| {
            format!(
                "{}/api/v1/auth/{}/callback",
                trim_base(base),
                policy.callback_segment()
            )
        })
    }

    fn expected_issuer(&self) -> String {
        format!(
            "https://{}.b2clogin.com/{}/v2.0/",
            self.config.tenant_name.to_lowercase(),
            self.config.tenant_id
        )
    }

    async fn post_token_form(
        &self,
        policy: Policy,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<TokenSet, ClientError> {
        let secret = self
            .config
            .client_secret
            .clone()
            .ok_or_else(|| ClientError::NotConfigured("B2C client secret".to_string()))?;

        form.push(("client_id", self.config.client_id.clone()));
        form.push(("client_secret", secret));
        form.push(("scope", self.scope()));
        if let Some(redirect_uri) = self.redirect_uri(policy) {
            form.push(("redirect_uri", redirect_uri));
        }

        let response = self
            .http
            .post(self.token_url(policy))
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        check_status(SERVICE, response)
            .await?
            .json::<TokenSet>()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))
    }
}

fn authority(config: &B2cConfig) -> String {
    match config.authority_base.as_deref() {
        Some(base) => trim_base(base).to_string(),
        None => format!("https://{}.b2clogin.com", config.tenant_name),
    }
}

#[async_trait]
impl IdentityProvider for B2cClient {
    async fn exchange_code(&self, policy: Policy, code: &str) -> Result<TokenSet, ClientError> {
        tracing::info!(policy = policy.callback_segment(), "Exchanging authorization code");
        self.post_token_form(
            policy,
            vec![
                ("grant_type", "authorization_code".to_string()),
                ("code", code.to_string()),
            ],
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ClientError> {
        self.post_token_form(
            Policy::SignIn,
            vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
            ],
        )
        .await
    }

    async fn verify_token(
        &self,
        policy: Policy,
        token: &str,
    ) -> Result<IdTokenClaims, ClientError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.config.client_id]);
        validation.set_issuer(&[self.expected_issuer()]);
        // Signature, audience and issuer only; lifetime claims are not checked.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let verifier = match policy {
            Policy::SignUp => &self.signup_keys,
            Policy::SignIn => &self.signin_keys,
        };
        verifier.verify(token, &validation).await
    }
}
