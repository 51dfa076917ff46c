//! RS256 verification against a remote JSON Web Key Set.
//!
//! Used for Azure AD B2C id/access tokens and Bot Framework activity tokens.
//! Keys are cached by `kid`; an unknown `kid` triggers a refetch.

use std::num::NonZeroUsize;

use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::{ClientError, check_status};

const KEY_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(64).expect("non-zero cache size");

/// Where the signing keys are published.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A JWKS document URL.
    Direct(String),
    /// An OpenID metadata document whose `jwks_uri` points at the keys.
    OpenIdMetadata(String),
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JsonWebKey>,
}

#[derive(Debug, Deserialize, Clone)]
struct JsonWebKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenIdMetadata {
    jwks_uri: String,
}

/// Verifies JWTs with keys fetched from a [`KeySource`].
pub struct JwksVerifier {
    http: Client,
    source: KeySource,
    cache: RwLock<LruCache<String, JsonWebKey>>,
}

impl JwksVerifier {
    pub fn new(http: Client, source: KeySource) -> Self {
        Self {
            http,
            source,
            cache: RwLock::new(LruCache::new(KEY_CACHE_SIZE)),
        }
    }

    /// Verify `token` and deserialize its claims. The caller owns the validation rules.
    pub async fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<T, ClientError> {
        let header = decode_header(token)
            .map_err(|e| ClientError::Verification(format!("invalid token header: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| ClientError::Verification("token has no 'kid'".to_string()))?;

        let jwk = self.key_for(&kid).await?;
        let key = decoding_key(&jwk)?;

        decode::<T>(token, &key, validation)
            .map(|data| data.claims)
            .map_err(|e| ClientError::Verification(e.to_string()))
    }

    async fn key_for(&self, kid: &str) -> Result<JsonWebKey, ClientError> {
        {
            let mut cache = self.cache.write().await;
            if let Some(jwk) = cache.get(kid) {
                return Ok(jwk.clone());
            }
        }

        let jwks = self.fetch_jwks().await?;
        let mut found = None;
        {
            let mut cache = self.cache.write().await;
            for key in jwks.keys {
                if let Some(key_id) = key.kid.clone() {
                    if key_id == kid {
                        found = Some(key.clone());
                    }
                    cache.put(key_id, key);
                }
            }
        }

        found.ok_or_else(|| ClientError::Verification(format!("signing key '{}' not found", kid)))
    }

    async fn fetch_jwks(&self) -> Result<JwksResponse, ClientError> {
        let jwks_url = match &self.source {
            KeySource::Direct(url) => url.clone(),
            KeySource::OpenIdMetadata(url) => {
                let response = self.http.get(url).send().await?;
                let metadata: OpenIdMetadata = check_status("openid-metadata", response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ClientError::malformed("openid-metadata", e))?;
                metadata.jwks_uri
            }
        };

        tracing::debug!(url = %jwks_url, "Fetching signing keys");
        let response = self.http.get(&jwks_url).send().await?;
        check_status("jwks", response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::malformed("jwks", e))
    }
}

fn decoding_key(jwk: &JsonWebKey) -> Result<DecodingKey, ClientError> {
    if jwk.kty != "RSA" {
        return Err(ClientError::Verification(format!(
            "unsupported key type '{}'",
            jwk.kty
        )));
    }
    let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
        return Err(ClientError::Verification(
            "RSA key is missing modulus or exponent".to_string(),
        ));
    };
    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| ClientError::Verification(format!("invalid RSA key: {}", e)))
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Fixed RSA key pair for signing tokens in tests.

    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde::Serialize;

    pub const KID: &str = "test-key-1";

    pub const PRIVATE_KEY_PEM: &str = include_str!("../../tests/fixtures/test_rsa_private.pem");
    pub const MODULUS_B64URL: &str = include_str!("../../tests/fixtures/test_rsa_modulus.txt");
    pub const EXPONENT_B64URL: &str = "AQAB";

    pub fn jwks_json() -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": KID,
                "use": "sig",
                "n": MODULUS_B64URL.trim(),
                "e": EXPONENT_B64URL,
            }]
        })
    }

    pub fn sign<T: Serialize>(claims: &T) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(KID.to_string());
        let key = EncodingKey::from_rsa_pem(PRIVATE_KEY_PEM.as_bytes()).unwrap();
        encode(&header, claims, &key).unwrap()
    }
}
