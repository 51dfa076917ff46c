//! Dependency health report for `/api/v1/system/health`.

use std::collections::BTreeMap;

use sea_orm::DatabaseConnection;
use serde_json::json;

use crate::clients::{BlobStore, ChatMessage, ChatRequest, LanguageModel, VectorIndex};
use crate::db::{TenantConnector, health_check};
use crate::error::{ApiError, ErrorCode};
use crate::repositories::TenantRepository;

const OK: &str = "ok";
const ERROR: &str = "error";

/// Per-service status, keyed by service (tenant databases by server name).
pub type ServiceStatuses = BTreeMap<String, String>;

/// Everything the health check covers.
pub struct ServiceHealthCheck<'a> {
    pub master: &'a DatabaseConnection,
    pub tenants: &'a TenantConnector,
    pub blob: &'a dyn BlobStore,
    pub llm: &'a dyn LanguageModel,
    pub search: &'a dyn VectorIndex,
}

impl ServiceHealthCheck<'_> {
    pub async fn check(&self) -> ServiceStatuses {
        let mut services = ServiceStatuses::new();

        match health_check(self.master).await {
            Ok(()) => {
                services.insert("master_db".into(), OK.into());
            }
            Err(e) => {
                tracing::error!(error = %e, "Master database check failed");
                services.insert("master_db".into(), ERROR.into());
            }
        }

        match TenantRepository::new(self.master).list().await {
            Ok(tenants) => {
                for tenant in tenants {
                    let server = tenant.company_server_name;
                    let status = match self.tenants.connect(&server).await {
                        Ok(conn) => match health_check(&conn).await {
                            Ok(()) => OK.to_string(),
                            Err(e) => format!("error ({})", e),
                        },
                        Err(e) => format!("error ({})", e),
                    };
                    if status != OK {
                        tracing::error!(server, status, "Tenant database check failed");
                    }
                    services.insert(server, status);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Error retrieving tenant server names");
                services.insert("tenant_db".into(), ERROR.into());
            }
        }

        let blob = self.blob.ping().await;
        services.insert("blob_storage".into(), status_of("blob_storage", blob));

        let ping = ChatRequest::new(vec![ChatMessage::user("test")])
            .max_tokens(5)
            .temperature(0.5);
        let llm = self.llm.chat(ping).await.map(|_| ());
        services.insert("azure_openai".into(), status_of("azure_openai", llm));

        let search = self.search.list_indexes().await.map(|_| ());
        services.insert("azure_search".into(), status_of("azure_search", search));

        services
    }
}

fn status_of<E: std::fmt::Display>(service: &str, result: Result<(), E>) -> String {
    match result {
        Ok(()) => OK.to_string(),
        Err(e) => {
            tracing::error!(service, error = %e, "Health check failed");
            ERROR.to_string()
        }
    }
}

/// SERVICE_UNAVAILABLE carrying the map when any service reported an error.
pub fn ensure_healthy(services: &ServiceStatuses) -> Result<(), ApiError> {
    if services.values().any(|status| status.starts_with(ERROR)) {
        return Err(ApiError::new(
            ErrorCode::ServiceUnavailable,
            "One or more health checks failed",
        )
        .with_details(json!(services)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_error_marks_unhealthy() {
        let mut services = ServiceStatuses::new();
        services.insert("master_db".into(), "ok".into());
        services.insert("tenant-a".into(), "ok".into());
        assert!(ensure_healthy(&services).is_ok());

        services.insert("tenant-b".into(), "error (connection refused)".into());
        let err = ensure_healthy(&services).unwrap_err();
        assert_eq!(err.status_code, 503);
        assert_eq!(
            err.details.as_deref().and_then(|d| d.get("tenant-b")),
            Some(&json!("error (connection refused)"))
        );
    }
}
