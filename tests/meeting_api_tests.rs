//! Meeting transcript conversion.

use anyhow::Result;
use axum::http::StatusCode;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{TestApp, get, multipart_upload, send};

const TRANSCRIPT: &str = "週次定例 2024/01/10\n\n山田：今週の進捗を共有します\n[佐藤] 経費精算は完了しました\n";

#[tokio::test]
async fn transcript_is_stored_as_conversation_csv() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;

    let (status, body) = send(
        app.router(),
        multipart_upload(
            &format!("/api/v1/meeting/{}/upload", company_id),
            "weekly.txt",
            "text/plain",
            TRANSCRIPT.as_bytes(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "ファイルが正常にアップロードされました");
    assert_eq!(body["rows"], 3);
    let file_id = body["fileId"].as_str().unwrap().to_string();

    let names = app.blob.names();
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("_weekly.csv"));

    let (status, body) = send(
        app.router(),
        get(&format!(
            "/api/v1/company/{}/data/status/{}",
            company_id, file_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fileStatus"]["recordsCount"], 3);
    Ok(())
}

#[tokio::test]
async fn non_text_transcript_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;

    let (status, body) = send(
        app.router(),
        multipart_upload(
            &format!("/api/v1/meeting/{}/upload", company_id),
            "weekly.docx",
            "application/octet-stream",
            b"binary",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error_message"],
        "テキストファイル(.txt)をアップロードしてください"
    );
    assert!(app.blob.names().is_empty());
    Ok(())
}
