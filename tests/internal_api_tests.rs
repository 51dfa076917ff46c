//! Identity provider API connector: invite verification and user provisioning.

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{BASIC_PASSWORD, BASIC_USER, EXTENSION_ID, TestApp, json_request, send};

fn extension(attribute: &str) -> String {
    format!("extension_{}_{}", EXTENSION_ID.replace('-', ""), attribute)
}

fn connector_request(path: &str, claims: &Value) -> Request<Body> {
    let credentials = STANDARD.encode(format!("{}:{}", BASIC_USER, BASIC_PASSWORD));
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Basic {}", credentials))
        .header("content-type", "application/json")
        .body(Body::from(claims.to_string()))
        .unwrap()
}

/// Creates a company over HTTP and returns its id and default invite code.
async fn company_with_code(app: &TestApp) -> Result<(Uuid, String)> {
    let (_, body) = send(
        app.router(),
        json_request(
            "POST",
            "/api/v1/company",
            &json!({ "company_name": "Acme", "company_server_name": "acme-db" }),
        ),
    )
    .await;
    let company_id = body["company_id"].as_str().unwrap().parse()?;
    let code = body["message"]
        .as_str()
        .unwrap()
        .rsplit(": ")
        .next()
        .unwrap()
        .to_string();
    Ok((company_id, code))
}

#[tokio::test]
async fn connector_endpoints_require_basic_credentials() -> Result<()> {
    let app = TestApp::new().await?;

    let (status, _) = send(
        app.router(),
        json_request("POST", "/api/v1/internal/b2c/verify-invite", &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/internal/b2c/user-provision")
        .header(
            "authorization",
            format!("Basic {}", STANDARD.encode("connector:wrong")),
        )
        .header("content-type", "application/json")
        .body(Body::from("{}"))?;
    let (status, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn invite_code_is_single_use() -> Result<()> {
    let app = TestApp::new().await?;
    let (company_id, code) = company_with_code(&app).await?;
    let claims = json!({
        "email": "hanako@outside.example",
        (extension("companyId")): company_id.to_string(),
        (extension("inviteCode")): code,
    });

    let (status, body) = send(
        app.router(),
        connector_request("/api/v1/internal/b2c/verify-invite", &claims),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "Continue");
    assert_eq!(body["version"], "1.0.0");
    assert_eq!(body["extension_inviteCode"], code);

    let (status, body) = send(
        app.router(),
        connector_request("/api/v1/internal/b2c/verify-invite", &claims),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["action"], "ValidationError");
    assert_eq!(body["userMessage"], "無効な招待コードです");
    Ok(())
}

#[tokio::test]
async fn allowed_domain_skips_invite_code() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let admin = app.user(company_id, "company_admin").await?;
    send(
        app.router(),
        test_utils::authed(
            "PATCH",
            &format!("/api/v1/company/{}/allowed-domains", company_id),
            &admin,
            Some(&json!({ "allowed_domains": ["@example.com"] })),
        ),
    )
    .await;

    let (status, body) = send(
        app.router(),
        connector_request(
            "/api/v1/internal/b2c/verify-invite",
            &json!({
                "email": "hanako@Example.com",
                (extension("companyId")): company_id.to_string(),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "Continue");

    let (status, body) = send(
        app.router(),
        connector_request(
            "/api/v1/internal/b2c/verify-invite",
            &json!({
                "email": "hanako@other.example",
                (extension("companyId")): company_id.to_string(),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["userMessage"], "招待コードが必要です");
    Ok(())
}

#[tokio::test]
async fn missing_company_claim_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = send(
        app.router(),
        connector_request(
            "/api/v1/internal/b2c/verify-invite",
            &json!({ "email": "hanako@example.com" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["userMessage"], "会社IDが見つかりません");
    Ok(())
}

#[tokio::test]
async fn user_provision_creates_the_tenant_user_once() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let claims = json!({
        "objectId": "azure-user-1",
        "email": "hanako@example.com",
        "displayName": "Hanako",
        (extension("companyId")): company_id.to_string(),
        (extension("role")): "member",
    });

    let (status, body) = send(
        app.router(),
        connector_request("/api/v1/internal/b2c/user-provision", &claims),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "version": "1.0.0", "status": "ok" }));

    let db = app.tenant_db(company_id).await?;
    let user = inthub::repositories::CompanyUserRepository::new(&db)
        .find_by_azure_id("azure-user-1")
        .await?
        .expect("provisioned user");
    assert_eq!(user.name, "Hanako");
    assert_eq!(user.role, "member");

    let (status, body) = send(
        app.router(),
        connector_request("/api/v1/internal/b2c/user-provision", &claims),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "DUPLICATE_ENTRY");
    Ok(())
}
