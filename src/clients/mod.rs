//! # Outbound HTTP clients
//!
//! Thin reqwest wrappers around the external services the API depends on.
//! Each client sits behind a trait so handlers and services can be exercised
//! with in-memory fakes, and the real implementations are tested against
//! `wiremock`.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use thiserror::Error;

pub mod b2c;
pub mod blob;
pub mod bot_framework;
pub mod jwks;
pub mod openai;
pub mod search;
pub mod slack;

pub use b2c::{B2cClient, IdTokenClaims, IdentityProvider, Policy, TokenSet};
pub use blob::{AzureBlobStore, BlobItem, BlobStore};
pub use bot_framework::{BotConnector, BotFrameworkClient};
pub use jwks::{JwksVerifier, KeySource};
pub use openai::{AzureOpenAi, ChatMessage, ChatRequest, LanguageModel};
pub use search::{AzureSearch, SearchDocument, SearchHit, VectorIndex};
pub use slack::{SlackApi, SlackClient};

/// Failures talking to an upstream service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} returned status {status}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} rate limited; retry after {retry_after}s")]
    RateLimited {
        service: &'static str,
        retry_after: u64,
    },

    #[error("Slack API error: {error}")]
    Slack { error: String },

    #[error("malformed {service} response: {details}")]
    Malformed {
        service: &'static str,
        details: String,
    },

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("token verification failed: {0}")]
    Verification(String),
}

impl ClientError {
    pub(crate) fn malformed(service: &'static str, details: impl ToString) -> Self {
        ClientError::Malformed {
            service,
            details: details.to_string(),
        }
    }
}

/// Shared reqwest client with the default request timeout.
pub fn build_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Passes successful responses through and turns the rest into [`ClientError`].
///
/// A 429 becomes [`ClientError::RateLimited`] using `Retry-After` (default 60s).
pub(crate) async fn check_status(
    service: &'static str,
    response: Response,
) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClientError::RateLimited {
            service,
            retry_after: retry_after_secs(&response).unwrap_or(60),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Upstream {
        service,
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Trims a trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_base(base: &str) -> &str {
    base.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let response = build_http_client().get(server.uri()).send().await.unwrap();
        let err = check_status("test", response).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::RateLimited {
                retry_after: 7,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn keeps_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down for maintenance"))
            .mount(&server)
            .await;

        let response = build_http_client().get(server.uri()).send().await.unwrap();
        match check_status("test", response).await {
            Err(ClientError::Upstream { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "down for maintenance");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(trim_base("https://x.example/"), "https://x.example");
        assert_eq!(trim_base("https://x.example"), "https://x.example");
    }
}
