//! Company onboarding, senpai personas, data files and tenant settings.

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{SAMPLE_CSV, TestApp, authed, get, json_request, multipart_upload, send};

#[tokio::test]
async fn create_company_provisions_tenant_and_invite_code() -> Result<()> {
    let app = TestApp::new().await?;

    let (status, body) = send(
        app.router(),
        json_request(
            "POST",
            "/api/v1/company",
            &json!({ "company_name": "Acme", "company_server_name": "acme-db" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .starts_with("Company created successfully. Default invite code: ")
    );
    let company_id: Uuid = body["company_id"].as_str().unwrap().parse()?;

    let (status, body) = send(app.router(), get(&format!("/api/v1/company/{}", company_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant"]["company_name"], "Acme");
    assert_eq!(body["tenant"]["company_server_name"], "acme-db");

    let (status, body) = send(app.router(), get("/api/v1/company")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenants"].as_array().unwrap().len(), 1);
    assert_eq!(body["tenants"][0]["company_id"], company_id.to_string());
    Ok(())
}

#[tokio::test]
async fn duplicate_company_name_conflicts() -> Result<()> {
    let app = TestApp::new().await?;
    app.company("Acme").await?;

    let (status, body) = send(
        app.router(),
        json_request(
            "POST",
            "/api/v1/company",
            &json!({ "company_name": "Acme", "company_server_name": "other-db" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "DUPLICATE_ENTRY");
    assert_eq!(body["details"]["company_name"], "Acme");
    Ok(())
}

#[tokio::test]
async fn unknown_company_is_not_found() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = send(
        app.router(),
        get(&format!("/api/v1/company/{}/senpai", Uuid::new_v4())),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status_code"], 404);
    Ok(())
}

#[tokio::test]
async fn senpai_registration_and_lookup() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let other = app.company("Globex").await?;

    let (status, body) = send(
        app.router(),
        json_request(
            "POST",
            &format!("/api/v1/company/{}/senpai", company_id),
            &json!({ "senpai_name": "経理の佐藤さん", "profile": { "team": "finance" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let senpai_id = body["senpai_id"].as_str().unwrap().to_string();

    let (_, body) = send(
        app.router(),
        get(&format!("/api/v1/company/{}/senpai", company_id)),
    )
    .await;
    let senpais = body["senpais"].as_array().unwrap();
    assert_eq!(senpais.len(), 1);
    assert_eq!(senpais[0]["senpai_name"], "経理の佐藤さん");
    assert_eq!(senpais[0]["profile"]["team"], "finance");

    let (status, body) = send(
        app.router(),
        get(&format!("/api/v1/company/{}/senpai/{}", company_id, senpai_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["senpai_id"], senpai_id);

    let (status, _) = send(
        app.router(),
        get(&format!("/api/v1/company/{}/senpai/{}", other, senpai_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn csv_upload_status_and_delete() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;

    let (status, body) = send(
        app.router(),
        multipart_upload(
            &format!("/api/v1/company/{}/data/upload", company_id),
            "faq.csv",
            "text/csv",
            SAMPLE_CSV.as_bytes(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "File uploaded successfully");
    let file_id = body["fileId"].as_str().unwrap().to_string();

    let names = app.blob.names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with(&format!("{}/", company_id)));
    assert!(names[0].ends_with("_faq.csv"));

    let (status, body) = send(
        app.router(),
        get(&format!(
            "/api/v1/company/{}/data/status/{}",
            company_id, file_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fileStatus"]["currentStage"], "uploaded");
    assert_eq!(body["fileStatus"]["recordsCount"], 2);

    let (status, _) = send(
        app.router(),
        json_request(
            "DELETE",
            &format!("/api/v1/company/{}/data/delete", company_id),
            &json!({ "file_id": file_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.blob.names().is_empty());

    let (status, _) = send(
        app.router(),
        get(&format!(
            "/api/v1/company/{}/data/status/{}",
            company_id, file_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn non_csv_upload_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;

    let (status, body) = send(
        app.router(),
        multipart_upload(
            &format!("/api/v1/company/{}/data/upload", company_id),
            "notes.txt",
            "text/plain",
            b"hello",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error_message"],
        "アップロードされたファイルはCSV形式ではありません。"
    );
    assert!(app.blob.names().is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_upload_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let data = vec![b'a'; 10 * 1024 * 1024 + 1];

    let (status, body) = send(
        app.router(),
        multipart_upload(
            &format!("/api/v1/company/{}/data/upload", company_id),
            "big.csv",
            "text/csv",
            &data,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error_code"], "PAYLOAD_TOO_LARGE");
    Ok(())
}

#[tokio::test]
async fn restore_recreates_missing_file_records_once() -> Result<()> {
    use inthub::clients::BlobStore;

    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    app.blob
        .upload(
            &format!("{}/20240501090000_faq.csv", company_id),
            SAMPLE_CSV.as_bytes().to_vec(),
            "text/csv",
        )
        .await?;

    let uri = format!("/api/v1/company/{}/data/restore", company_id);
    let (status, body) = send(app.router(), json_request("POST", &uri, &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let restored = body["restored_files"].as_array().unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0]["fileName"], "20240501090000_faq.csv");

    let (_, body) = send(app.router(), json_request("POST", &uri, &json!({}))).await;
    assert!(body["restored_files"].as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn prompt_template_update_and_reset() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let uri = format!("/api/v1/company/{}/rag/prompt", company_id);

    let (_, body) = send(app.router(), get(&uri)).await;
    assert_eq!(body["prompt"], "");

    let (status, _) = send(
        app.router(),
        json_request("PUT", &uri, &json!({ "prompt": "丁寧語で答えてください" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(app.router(), get(&uri)).await;
    assert_eq!(body["prompt"], "丁寧語で答えてください");

    let (status, _) = send(app.router(), json_request("DELETE", &uri, &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(app.router(), get(&uri)).await;
    assert_eq!(body["prompt"], "");
    Ok(())
}

#[tokio::test]
async fn invite_codes_require_an_admin_of_the_company() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let other = app.company("Globex").await?;
    let admin = app.user(company_id, "company_admin").await?;
    let member = app.user(company_id, "member").await?;
    let uri = format!("/api/v1/company/{}/invite-codes", company_id);

    let (status, body) = send(
        app.router(),
        authed("POST", &uri, &admin, Some(&json!({ "expires_in_days": 3 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"].as_str().unwrap().len(), 12);
    assert_eq!(body["company_id"], company_id.to_string());

    let (status, _) = send(app.router(), authed("POST", &uri, &member, Some(&json!({})))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        app.router(),
        authed(
            "POST",
            &format!("/api/v1/company/{}/invite-codes", other),
            &admin,
            Some(&json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(app.router(), json_request("POST", &uri, &json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn allowed_domains_are_validated_and_scoped() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;
    let other = app.company("Globex").await?;
    let admin = app.user(company_id, "company_admin").await?;
    let uri = format!("/api/v1/company/{}/allowed-domains", company_id);

    let (status, body) = send(
        app.router(),
        authed(
            "PATCH",
            &uri,
            &admin,
            Some(&json!({ "allowed_domains": ["example.com"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_DOMAIN_FORMAT");

    let (status, _) = send(
        app.router(),
        authed(
            "PATCH",
            &uri,
            &admin,
            Some(&json!({ "allowed_domains": ["@example.com"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(app.router(), authed("GET", &uri, &admin, None)).await;
    assert_eq!(body["allowed_domains"], json!(["@example.com"]));

    let (status, _) = send(
        app.router(),
        authed(
            "GET",
            &format!("/api/v1/company/{}/allowed-domains", other),
            &admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn malformed_json_body_returns_error_envelope() -> Result<()> {
    use axum::{body::Body, http::Request};

    let app = TestApp::new().await?;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/company")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"company_name": "#))?;

    let (status, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert_eq!(body["status_code"], 400);
    assert!(
        body["error_message"]
            .as_str()
            .unwrap()
            .starts_with("JSON syntax error")
    );
    Ok(())
}

#[tokio::test]
async fn missing_field_returns_error_envelope() -> Result<()> {
    let app = TestApp::new().await?;

    let (status, body) = send(
        app.router(),
        json_request("POST", "/api/v1/company", &json!({ "company_name": "Acme" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert!(
        body["error_message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON")
    );
    Ok(())
}

#[tokio::test]
async fn unparsable_company_id_returns_error_envelope() -> Result<()> {
    let app = TestApp::new().await?;

    let (status, body) = send(app.router(), get("/api/v1/company/not-a-uuid")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert!(body["error_message"].is_string());
    Ok(())
}

#[tokio::test]
async fn server_name_outside_host_label_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;

    let (status, body) = send(
        app.router(),
        json_request(
            "POST",
            "/api/v1/company",
            &json!({ "company_name": "Acme", "company_server_name": "attacker.example:5432/x?" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert_eq!(body["details"]["company_server_name"], "attacker.example:5432/x?");

    let (_, body) = send(app.router(), get("/api/v1/company")).await;
    assert_eq!(body["tenants"].as_array().unwrap().len(), 0);
    Ok(())
}
