//! Logging setup and per-request correlation ids.
//!
//! [`init_tracing`] installs the process-wide subscriber. [`request_context`]
//! tags each request with an id that error envelopes report as `trace_id`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    filter::ParseError,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Overrides the configured level, e.g. `INTHUB_LOG=inthub=trace,sqlx=info`.
pub const LOG_FILTER_ENV: &str = "INTHUB_LOG";

/// Appended to a bare level so driver and HTTP client chatter stays out of debug logs.
const DEPENDENCY_DIRECTIVES: &str = "sqlx=warn,sea_orm_migration=info,hyper_util=info,reqwest=info";

/// Correlation id of the request being handled.
#[derive(Debug, Clone)]
pub struct RequestTrace {
    pub request_id: String,
}

task_local! {
    static CURRENT_REQUEST: RequestTrace;
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {source}")]
    Filter { filter: String, source: ParseError },
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static SUBSCRIBER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// `INTHUB_LOG`, then `RUST_LOG`, then the configured level with dependency defaults.
fn log_filter(config: &AppConfig, env: impl Fn(&str) -> Option<String>) -> String {
    [LOG_FILTER_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|name| env(name))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{},{}", config.log_level, DEPENDENCY_DIRECTIVES))
}

/// Installs the global subscriber. Only the first successful call has an effect.
///
/// `log` records from dependencies are bridged into tracing unless another
/// logger was registered first.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let filter = log_filter(config, |name| std::env::var(name).ok());
    let env_filter = match EnvFilter::try_new(&filter) {
        Ok(env_filter) => env_filter,
        Err(source) => {
            SUBSCRIBER_INSTALLED.store(false, Ordering::SeqCst);
            return Err(TelemetryError::Filter { filter, source });
        }
    };

    let output = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
    };

    let bridged = LogTracer::init();
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(output)
        .try_init()
    {
        SUBSCRIBER_INSTALLED.store(false, Ordering::SeqCst);
        return Err(err.into());
    }
    if let Err(err) = bridged {
        tracing::debug!(error = %err, "log records not bridged");
    }

    tracing::info!(
        service = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        filter = %filter,
        "Tracing initialized"
    );
    Ok(())
}

/// Runs `future` with `trace` as the current request.
pub async fn in_request_scope<Fut, R>(trace: RequestTrace, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    CURRENT_REQUEST.scope(trace, future).await
}

pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST.try_with(|trace| trace.request_id.clone()).ok()
}

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Adopts the caller's `x-request-id` (at most 128 bytes) or mints a UUID,
/// scopes it for the handler and echoes it on the response. 5xx responses
/// are logged with their latency.
pub async fn request_context(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    // Auth callbacks carry authorization codes in the query string.
    let query = if path.starts_with("/api/v1/auth/") {
        None
    } else {
        request.uri().query().map(str::to_string)
    };
    let started = Instant::now();

    let trace = RequestTrace {
        request_id: request_id.clone(),
    };
    let mut response = in_request_scope(trace, next.run(request)).await;

    let status = response.status();
    if status.is_server_error() {
        tracing::error!(
            request_id = %request_id,
            method = %method,
            path = %path,
            query = query.as_deref().unwrap_or(""),
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request failed"
        );
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}
