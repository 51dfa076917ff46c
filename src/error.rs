//! # Error Handling
//!
//! Unified error handling for the Inthub API. Every failure leaves a handler as
//! a JSON envelope of `error_code`, `error_message`, `status_code` and `details`,
//! with the request trace id attached for log correlation.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::clients::ClientError;
use crate::db::DatabaseError;
use crate::repositories::SecretError;
use crate::telemetry;

/// Application error codes with their default message and HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DatabaseError,
    DuplicateEntry,
    InvalidRequest,
    ValidationError,
    AuthenticationError,
    AuthorizationError,
    InvalidToken,
    NotFound,
    InternalServerError,
    ServiceUnavailable,
    ConfigError,
    SlackError,
    SlackTokenError,
    SlackChannelError,
    SlackUserError,
    SlackMessageError,
    SlackPostError,
    SlackUpdateError,
    InvalidInviteCode,
    InvalidDomainFormat,
    PayloadTooLarge,
    UnsupportedMediaType,
}

impl ErrorCode {
    /// HTTP status returned for this code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::DuplicateEntry => StatusCode::CONFLICT,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthorizationError => StatusCode::FORBIDDEN,
            ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SlackError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SlackTokenError => StatusCode::UNAUTHORIZED,
            ErrorCode::SlackChannelError => StatusCode::NOT_FOUND,
            ErrorCode::SlackUserError => StatusCode::NOT_FOUND,
            ErrorCode::SlackMessageError => StatusCode::BAD_REQUEST,
            ErrorCode::SlackPostError => StatusCode::BAD_REQUEST,
            ErrorCode::SlackUpdateError => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidInviteCode => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidDomainFormat => StatusCode::BAD_REQUEST,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }

    /// Wire representation (SCREAMING_SNAKE_CASE).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::DuplicateEntry => "DUPLICATE_ENTRY",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorCode::AuthorizationError => "AUTHORIZATION_ERROR",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::SlackError => "SLACK_ERROR",
            ErrorCode::SlackTokenError => "SLACK_TOKEN_ERROR",
            ErrorCode::SlackChannelError => "SLACK_CHANNEL_ERROR",
            ErrorCode::SlackUserError => "SLACK_USER_ERROR",
            ErrorCode::SlackMessageError => "SLACK_MESSAGE_ERROR",
            ErrorCode::SlackPostError => "SLACK_POST_ERROR",
            ErrorCode::SlackUpdateError => "SLACK_UPDATE_ERROR",
            ErrorCode::InvalidInviteCode => "INVALID_INVITE_CODE",
            ErrorCode::InvalidDomainFormat => "INVALID_DOMAIN_FORMAT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
        }
    }

    /// Message used when the caller does not supply one.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::DuplicateEntry => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request parameters",
            ErrorCode::ValidationError => "Validation error",
            ErrorCode::AuthenticationError => "Authentication failed",
            ErrorCode::AuthorizationError => "Authorization failed",
            ErrorCode::InvalidToken => "Invalid token",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InternalServerError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service unavailable",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::SlackError => "Slack operation failed",
            ErrorCode::SlackTokenError => "Slack token error",
            ErrorCode::SlackChannelError => "Slack channel error",
            ErrorCode::SlackUserError => "Slack user error",
            ErrorCode::SlackMessageError => "Slack message error",
            ErrorCode::SlackPostError => "Slack post error",
            ErrorCode::SlackUpdateError => "Slack update error",
            ErrorCode::InvalidInviteCode => "Invalid invite code",
            ErrorCode::InvalidDomainFormat => "Invalid domain format",
            ErrorCode::PayloadTooLarge => "Payload too large",
            ErrorCode::UnsupportedMediaType => "Unsupported media type",
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    #[serde(rename = "error_code")]
    pub code: Box<str>,
    /// Human-readable error message
    #[serde(rename = "error_message")]
    pub message: Box<str>,
    /// Numeric HTTP status mirrored into the body
    pub status_code: u16,
    /// Additional error context
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create an error for `code` with an explicit message.
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        let status = code.status_code();
        Self {
            status,
            code: code.as_str().into(),
            message: message.into().into_boxed_str(),
            status_code: status.as_u16(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Create an error for `code` using its default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Override the HTTP status while keeping the code.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self.status_code = status.as_u16();
        self
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code.as_ref() == code.as_str()
    }

    /// Extract current trace ID from the active request (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_request_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| {
            let code_str = code.as_ref();
            code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
        })
        .unwrap_or(false)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if self.status.is_server_error() {
            tracing::error!(
                error_code = %self.code,
                status_code = self.status_code,
                details = ?self.details,
                "{}",
                self.message
            );
        } else {
            tracing::debug!(error_code = %self.code, status_code = self.status_code, "{}", self.message);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            ErrorCode::InternalServerError,
            "An unexpected error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err.body_text()),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::from_code(ErrorCode::DuplicateEntry);
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => {
                Self::new(ErrorCode::NotFound, format!("Record not found: {}", record))
            }
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(ErrorCode::ServiceUnavailable, "Database service unavailable")
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::from_code(ErrorCode::DatabaseError)
                    .with_details(json!({ "error": other.to_string() }))
            }
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Upstream {
                service,
                status,
                body,
            } => upstream_error(service, status, Some(body)),
            ClientError::Slack { error } => {
                let code = match error.as_str() {
                    "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
                        ErrorCode::SlackTokenError
                    }
                    "channel_not_found" | "not_in_channel" => ErrorCode::SlackChannelError,
                    "user_not_found" | "users_not_found" => ErrorCode::SlackUserError,
                    "message_not_found" | "cant_update_message" => ErrorCode::SlackUpdateError,
                    _ => ErrorCode::SlackError,
                };
                Self::new(code, format!("Slack API error: {}", error))
            }
            ClientError::RateLimited {
                service,
                retry_after,
            } => Self::new(
                ErrorCode::ServiceUnavailable,
                format!("{} rate limited the request", service),
            )
            .with_details(json!({ "retry_after": retry_after })),
            ClientError::NotConfigured(what) => {
                Self::new(ErrorCode::ConfigError, format!("{} is not configured", what))
            }
            ClientError::Verification(message) => Self::new(ErrorCode::InvalidToken, message),
            other => {
                tracing::error!(error = %other, "Upstream client failure");
                Self::new(ErrorCode::InternalServerError, other.to_string())
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(error: DatabaseError) -> Self {
        match error {
            DatabaseError::ConnectionFailed { source } => source.into(),
            DatabaseError::UnknownCompany(company_id) => Self::new(
                ErrorCode::NotFound,
                format!("Company {} not found", company_id),
            ),
            DatabaseError::InvalidServerName(server) => {
                Self::new(ErrorCode::InvalidRequest, "Invalid company server name")
                    .with_details(json!({ "company_server_name": server }))
            }
            other => {
                tracing::error!(error = %other, "Tenant database failure");
                Self::from_code(ErrorCode::DatabaseError)
                    .with_details(json!({ "error": other.to_string() }))
            }
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(error: SecretError) -> Self {
        match error {
            SecretError::Database(e) => e.into(),
            SecretError::Crypto(e) => {
                tracing::error!(error = %e, "Secret could not be opened");
                Self::new(ErrorCode::InternalServerError, "Stored secret is unreadable")
            }
        }
    }
}

/// Create an upstream service error with a truncated body snippet.
pub fn upstream_error(service: &str, status: u16, body: Option<String>) -> ApiError {
    let body_snippet = body.map(|b| {
        if b.chars().count() > 200 {
            let truncated: String = b.chars().take(200).collect();
            format!("{}...", truncated)
        } else {
            b
        }
    });

    ApiError::new(
        ErrorCode::InternalServerError,
        format!("{} returned error status {}", service, status),
    )
    .with_details(json!({
        "service": service,
        "status": status,
        "body_snippet": body_snippet,
    }))
}

/// Create an authentication error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(ErrorCode::AuthenticationError, msg)
}

/// Create an authorization error (403)
pub fn forbidden(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Insufficient permissions");
    ApiError::new(ErrorCode::AuthorizationError, msg)
}

pub fn not_found<S: Into<String>>(message: S) -> ApiError {
    ApiError::new(ErrorCode::NotFound, message)
}

pub fn invalid_request<S: Into<String>>(message: S) -> ApiError {
    ApiError::new(ErrorCode::InvalidRequest, message)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(ErrorCode::ValidationError, message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(ErrorCode::InvalidRequest, "Test error message");

        assert_eq!(error.code, Box::from("INVALID_REQUEST"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.status_code, 400);
        assert_eq!(error.details, None);
    }

    #[test]
    fn test_default_messages() {
        let error = ApiError::from_code(ErrorCode::DuplicateEntry);
        assert_eq!(error.status, StatusCode::CONFLICT);
        assert_eq!(error.message, Box::from("Resource already exists"));

        let error = ApiError::from_code(ErrorCode::ValidationError);
        assert_eq!(error.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_slack_codes_status_mapping() {
        assert_eq!(ErrorCode::SlackTokenError.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::SlackChannelError.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::SlackPostError.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::SlackError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_api_error_with_details() {
        let error = ApiError::new(ErrorCode::InvalidRequest, "Test error message")
            .with_details(json!({"field": "value"}));

        assert_eq!(error.details, Some(Box::new(json!({"field": "value"}))));
    }

    #[test]
    fn test_envelope_shape() {
        let error = ApiError::from_code(ErrorCode::NotFound);
        let body = serde_json::to_value(&error).unwrap();

        assert_eq!(body["error_code"], "NOT_FOUND");
        assert_eq!(body["error_message"], "Resource not found");
        assert_eq!(body["status_code"], 404);
        assert!(body["details"].is_null());
        assert!(body.get("status").is_none());
    }

    #[test]
    fn test_from_anyhow() {
        let anyhow_error = anyhow::anyhow!("Something went wrong");
        let api_error: ApiError = anyhow_error.into();

        assert_eq!(api_error.code, Box::from("INTERNAL_SERVER_ERROR"));
        assert_eq!(api_error.message, Box::from("An unexpected error occurred"));
    }

    #[test]
    fn test_upstream_error_truncates_body() {
        let long_body = "x".repeat(500);
        let error = upstream_error("azure_search", 503, Some(long_body));

        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        let details = error.details.unwrap();
        let snippet = details["body_snippet"].as_str().unwrap();
        assert_eq!(snippet.chars().count(), 203);
        assert_eq!(details["status"], 503);
    }

    #[test]
    fn test_slack_client_error_mapping() {
        let error: ApiError = ClientError::Slack {
            error: "channel_not_found".to_string(),
        }
        .into();
        assert_eq!(error.code, Box::from("SLACK_CHANNEL_ERROR"));
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        let error: ApiError = ClientError::Slack {
            error: "invalid_auth".to_string(),
        }
        .into();
        assert_eq!(error.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_content_type_header() {
        let error = ApiError::new(ErrorCode::InvalidRequest, "Test error");

        let response = error.into_response();

        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_status_code_preservation() {
        let error = ApiError::from_code(ErrorCode::DuplicateEntry);

        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_with_status_overrides_both_fields() {
        let error = ApiError::new(ErrorCode::InvalidRequest, "bad").with_status(StatusCode::UNAUTHORIZED);
        assert_eq!(error.status, StatusCode::UNAUTHORIZED);
        assert_eq!(error.status_code, 401);
        assert!(error.is(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_trace_id_generation() {
        let error = ApiError::from_code(ErrorCode::InternalServerError);

        assert!(error.trace_id.is_some());
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_database_error_mapping() {
        let db_error = sea_orm::DbErr::RecordNotFound("test_record".to_string());
        let api_error: ApiError = db_error.into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert_eq!(api_error.code, Box::from("NOT_FOUND"));
        assert!(api_error.message.contains("test_record"));

        let api_error: ApiError = sea_orm::DbErr::Custom("boom".to_string()).into();
        assert_eq!(api_error.code, Box::from("DATABASE_ERROR"));
    }

    #[test]
    fn test_auth_error_helpers() {
        let auth_error = unauthorized(None);
        assert_eq!(auth_error.status, StatusCode::UNAUTHORIZED);
        assert_eq!(auth_error.code, Box::from("AUTHENTICATION_ERROR"));
        assert_eq!(auth_error.message, Box::from("Authentication required"));

        let forbidden_error = forbidden(Some("Admin access required"));
        assert_eq!(forbidden_error.status, StatusCode::FORBIDDEN);
        assert_eq!(forbidden_error.code, Box::from("AUTHORIZATION_ERROR"));
        assert_eq!(forbidden_error.message, Box::from("Admin access required"));
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({ "company_name": "required" });

        let validation_error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(validation_error.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(validation_error.code, Box::from("VALIDATION_ERROR"));
        assert_eq!(validation_error.details, Some(Box::new(field_errors)));
    }
}
