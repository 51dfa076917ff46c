//! Integration tests for sealed secrets in the master database
//!
//! Covers the round trip through `SecretRepository` and checks that bot
//! tokens stored by the Slack install never reach the table in clear text.

use anyhow::Result;
use inthub::crypto::{CryptoError, CryptoKey, decrypt_bytes, encrypt_bytes};
use inthub::models::master::secret;
use inthub::repositories::secret::{SecretError, SecretRepository, slack_token_name};
use sea_orm::EntityTrait;

#[path = "test_utils/mod.rs"]
mod test_utils;

fn key(byte: u8) -> CryptoKey {
    CryptoKey::new(vec![byte; 32]).expect("valid test key")
}

#[tokio::test]
async fn secret_round_trip_and_overwrite() -> Result<()> {
    let db = test_utils::setup_test_db().await?;
    let key = key(1);
    let secrets = SecretRepository::new(&db, &key);

    secrets.put("slack-token-T1", "xoxb-first").await?;
    secrets.put("slack-token-T1", "xoxb-second").await?;

    assert_eq!(
        secrets.get("slack-token-T1").await?.as_deref(),
        Some("xoxb-second")
    );
    assert!(secrets.get("slack-token-T2").await?.is_none());
    assert_eq!(secret::Entity::find().all(&db).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn secret_written_with_another_key_fails_to_open() -> Result<()> {
    let db = test_utils::setup_test_db().await?;
    let writer = key(1);
    let reader = key(2);
    SecretRepository::new(&db, &writer)
        .put("slack-token-T1", "xoxb-secret")
        .await?;

    let result = SecretRepository::new(&db, &reader)
        .get("slack-token-T1")
        .await;

    assert!(matches!(
        result,
        Err(SecretError::Crypto(CryptoError::DecryptionFailed(_)))
    ));
    Ok(())
}

#[test]
fn name_is_bound_to_ciphertext() {
    let key = key(9);
    let sealed = encrypt_bytes(&key, b"slack-token-T1", b"xoxb-secret").unwrap();

    assert!(decrypt_bytes(&key, b"slack-token-T2", &sealed).is_err());
    assert_eq!(
        decrypt_bytes(&key, b"slack-token-T1", &sealed).unwrap(),
        b"xoxb-secret"
    );
}

#[tokio::test]
async fn installed_bot_token_is_stored_sealed() -> Result<()> {
    use axum::http::StatusCode;
    use test_utils::{TestApp, get, send};

    let app = TestApp::new().await?;
    let company_id = app.company("Acme").await?;

    let (_, body) = send(
        app.router(),
        get(&format!("/api/v1/slack/authorize-url?company_id={}", company_id)),
    )
    .await;
    let url = url::Url::parse(body["url"].as_str().unwrap())?;
    let state = url
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let (status, _) = send(
        app.router(),
        get(&format!("/api/v1/slack/install?code=good-code&state={}", state)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let row = secret::Entity::find_by_id(slack_token_name("T1"))
        .one(&app.state.db)
        .await?
        .expect("token row");
    assert!(
        !row.ciphertext
            .windows(b"xoxb-test".len())
            .any(|w| w == b"xoxb-test")
    );

    let key = key(3);
    let opened = SecretRepository::new(&app.state.db, &key)
        .get(&slack_token_name("T1"))
        .await?;
    assert_eq!(opened.as_deref(), Some("xoxb-test"));
    Ok(())
}
