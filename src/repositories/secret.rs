//! # Secret Repository
//!
//! Named secrets (Slack bot tokens) sealed with the process key before they
//! reach the `secrets` table.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, Unchanged};
use thiserror::Error;

use crate::crypto::{CryptoError, CryptoKey, open_secret, seal_secret};
use crate::models::master::secret::{ActiveModel, Entity, Model};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub struct SecretRepository<'a> {
    db: &'a DatabaseConnection,
    key: &'a CryptoKey,
}

impl<'a> SecretRepository<'a> {
    pub fn new(db: &'a DatabaseConnection, key: &'a CryptoKey) -> Self {
        Self { db, key }
    }

    /// Seal and store `value` under `name`, replacing any previous value
    pub async fn put(&self, name: &str, value: &str) -> Result<(), SecretError> {
        let ciphertext = seal_secret(self.key, name, value)?;
        let now = Utc::now();

        if Entity::find_by_id(name.to_string()).one(self.db).await?.is_some() {
            ActiveModel {
                name: Unchanged(name.to_string()),
                ciphertext: Set(ciphertext),
                updated_at: Set(now),
                ..Default::default()
            }
            .update(self.db)
            .await?;
        } else {
            let model = Model {
                name: name.to_string(),
                ciphertext,
                created_at: now,
                updated_at: now,
            };
            Entity::insert(ActiveModel::from(model))
                .exec_without_returning(self.db)
                .await?;
        }
        tracing::info!(secret = name, "Stored secret");
        Ok(())
    }

    /// Open the secret stored under `name`
    pub async fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        let Some(row) = Entity::find_by_id(name.to_string()).one(self.db).await? else {
            return Ok(None);
        };
        Ok(Some(open_secret(self.key, name, &row.ciphertext)?))
    }
}

/// Secret name holding a workspace's bot token
pub fn slack_token_name(team_id: &str) -> String {
    format!("slack-token-{}", team_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{master_db, test_key};

    #[tokio::test]
    async fn put_overwrites_and_get_opens() {
        let db = master_db().await;
        let key = test_key();
        let repo = SecretRepository::new(&db, &key);

        repo.put(&slack_token_name("T1"), "xoxb-1").await.unwrap();
        repo.put(&slack_token_name("T1"), "xoxb-2").await.unwrap();

        assert_eq!(
            repo.get("slack-token-T1").await.unwrap().as_deref(),
            Some("xoxb-2")
        );
        assert!(repo.get("slack-token-T2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stored_bytes_are_not_plaintext() {
        let db = master_db().await;
        let key = test_key();
        SecretRepository::new(&db, &key)
            .put("slack-token-T9", "xoxb-visible")
            .await
            .unwrap();

        let row = Entity::find_by_id("slack-token-T9".to_string())
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        let needle = b"xoxb-visible";
        assert!(!row.ciphertext.windows(needle.len()).any(|w| w == needle));
    }
}
