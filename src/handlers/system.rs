//! Liveness and dependency health.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::server::AppState;
use crate::services::health::{ServiceHealthCheck, ServiceStatuses, ensure_healthy};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RootResponse {
    #[schema(example = "healthy")]
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    /// `ok` or `error (...)` per dependency
    pub services: ServiceStatuses,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TestResponse {
    pub message: String,
}

/// Liveness check
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service is running", body = RootResponse)),
    tag = "system"
)]
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "healthy".to_string(),
    })
}

/// Checks every database and upstream service
#[utoipa::path(
    get,
    path = "/api/v1/system/health",
    responses(
        (status = 200, description = "All dependencies healthy", body = HealthResponse),
        (status = 503, description = "At least one dependency failed", body = ApiError)
    ),
    tag = "system"
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let services = ServiceHealthCheck {
        master: &state.db,
        tenants: &state.tenants,
        blob: state.blob.as_ref(),
        llm: state.llm.as_ref(),
        search: state.search.as_ref(),
    }
    .check()
    .await;

    ensure_healthy(&services)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        services,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/system/test",
    responses((status = 200, description = "Smoke test", body = TestResponse)),
    tag = "system"
)]
pub async fn test() -> Json<TestResponse> {
    Json(TestResponse {
        message: (1 + 1).to_string(),
    })
}
