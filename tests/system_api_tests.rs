//! Liveness, health and documentation endpoints.

use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use inthub::{config::AppConfig, server::run_server};
use tokio_util::sync::CancellationToken;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{TestApp, get, send};

#[tokio::test]
async fn root_reports_healthy() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = send(app.router(), get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn smoke_test_endpoint_answers_two() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = send(app.router(), get("/api/v1/system/test")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "2");
    Ok(())
}

#[tokio::test]
async fn health_lists_every_dependency_and_tenant() -> Result<()> {
    let app = TestApp::new().await?;
    app.company("Acme").await?;

    let (status, body) = send(app.router(), get("/api/v1/system/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let services = &body["services"];
    assert_eq!(services["master_db"], "ok");
    assert_eq!(services["acme-db"], "ok");
    assert_eq!(services["blob_storage"], "ok");
    assert_eq!(services["azure_openai"], "ok");
    assert_eq!(services["azure_search"], "ok");
    Ok(())
}

#[tokio::test]
async fn openapi_document_is_served() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = send(app.router(), get("/openapi.json")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "InterHub API");
    assert!(body["paths"]["/api/v1/rag/query"].is_object());
    assert!(body["paths"]["/api/v1/slack/events"].is_object());
    Ok(())
}

#[tokio::test]
async fn request_id_is_echoed() -> Result<()> {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    let app = TestApp::new().await?;
    let request = Request::builder()
        .uri("/")
        .header("x-request-id", "req-42")
        .body(Body::empty())?;
    let response = app.router().oneshot(request).await?;
    assert_eq!(response.headers()["x-request-id"], "req-42");

    let response = app.router().oneshot(get("/")).await?;
    assert!(response.headers().contains_key("x-request-id"));
    Ok(())
}

#[tokio::test]
async fn run_server_names_an_unusable_bind_address() -> Result<()> {
    let app = TestApp::new().await?;
    let mut state = app.state.clone();
    state.config = Arc::new(AppConfig {
        api_bind_addr: "not-an-address".to_string(),
        ..(*state.config).clone()
    });

    let err = run_server(state, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("invalid bind address \"not-an-address\""));
    Ok(())
}
