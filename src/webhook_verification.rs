//! # Slack Request Verification
//!
//! Slack signs every Events API, interactivity and slash-command request with
//! HMAC-SHA256 over `v0:{timestamp}:{body}`. The middleware buffers the body,
//! checks the signature in constant time and hands the request on unchanged.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{ApiError, ErrorCode};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Errors that can occur during Slack signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: &'static str },

    #[error("Invalid signature format: {reason}")]
    InvalidSignatureFormat { reason: &'static str },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: &'static str },

    #[error("Invalid timestamp format")]
    InvalidTimestamp,

    #[error("Timestamp outside tolerance: {seconds}s skew, max allowed: {max_seconds}s")]
    StaleTimestamp { seconds: u64, max_seconds: u64 },

    #[error("Slack signing secret is not configured")]
    NotConfigured,
}

impl From<VerificationError> for ApiError {
    fn from(error: VerificationError) -> Self {
        match error {
            VerificationError::MissingTimestamp { .. }
            | VerificationError::InvalidTimestamp
            | VerificationError::StaleTimestamp { .. } => {
                ApiError::new(ErrorCode::InvalidRequest, "Invalid request timestamp")
            }
            VerificationError::NotConfigured => {
                ApiError::new(ErrorCode::ConfigError, error.to_string())
            }
            _ => ApiError::new(ErrorCode::AuthenticationError, "Invalid request signature"),
        }
    }
}

/// Result type for signature verification
pub type VerificationResult<T> = Result<T, VerificationError>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `v0=` followed by the hex HMAC of `v0:{timestamp}:{body}`.
pub fn slack_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a Slack v0 signature with timestamp validation against `now`.
pub fn verify_slack_signature(
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now: u64,
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        tolerance_seconds, "Starting Slack signature verification"
    );

    if timestamp_header.is_empty() {
        return Err(VerificationError::MissingTimestamp {
            header: "X-Slack-Request-Timestamp",
        });
    }

    let timestamp = timestamp_header
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    let skew = now.abs_diff(timestamp);
    if skew > tolerance_seconds {
        return Err(VerificationError::StaleTimestamp {
            seconds: skew,
            max_seconds: tolerance_seconds,
        });
    }

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Slack-Signature",
        });
    }

    let Some(provided_hex) = signature_header.strip_prefix("v0=") else {
        return Err(VerificationError::InvalidSignatureFormat {
            reason: "X-Slack-Signature must start with 'v0='",
        });
    };
    let provided =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
            reason: "X-Slack-Signature contains invalid hex",
        })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(format!("v0:{}:", timestamp_header).as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(&provided[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Checks the signing headers of a buffered request.
pub fn verify_request(headers: &HeaderMap, body: &[u8], config: &AppConfig) -> VerificationResult<()> {
    let secret = config
        .slack
        .signing_secret
        .as_deref()
        .ok_or(VerificationError::NotConfigured)?;

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
    };

    verify_slack_signature(
        body,
        header(SIGNATURE_HEADER),
        header(TIMESTAMP_HEADER),
        secret,
        config.slack.tolerance_seconds,
        unix_now(),
    )
}

/// Middleware for the Slack event, interactivity and command routes
pub async fn slack_signature_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::from_code(ErrorCode::PayloadTooLarge))?;

    if let Err(e) = verify_request(&parts.headers, &body_bytes, &config) {
        warn!(path = %parts.uri.path(), error = %e, "Slack signature verification failed");
        return Err(e.into());
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}
