//! # Invitation Token Repository
//!
//! Each company has at most one row; its `tokens` array holds every live code
//! and `expires_at` applies to all of them.

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set, SqlErr,
    sea_query::Expr,
};
use uuid::Uuid;

use crate::models::StringList;
use crate::models::master::invitation_token::{ActiveModel, Column, Entity, Model};

/// Attempts before giving up on a row that keeps changing underneath us.
const MAX_ATTEMPTS: usize = 5;

pub struct InvitationTokenRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> InvitationTokenRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_company(&self, company_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::CompanyId.eq(company_id))
            .one(self.db)
            .await
    }

    /// Create the company's row with a single code
    pub async fn create(
        &self,
        company_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            tokens: StringList(vec![token.to_string()]),
            company_id,
            expires_at,
            used: false,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        Entity::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    /// Apply `changes` only if `row` is still at the revision it was read at.
    async fn write_if_unchanged(&self, row: &Model, changes: ActiveModel) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .set(changes)
            .col_expr(Column::Revision, Expr::col(Column::Revision).add(1))
            .filter(Column::Id.eq(row.id))
            .filter(Column::Revision.eq(row.revision))
            .exec(self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Append a code and move the shared expiry, creating the row if needed
    pub async fn add_token(
        &self,
        company_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(existing) = self.find_by_company(company_id).await? else {
                match self.create(company_id, token, expires_at).await {
                    Ok(model) => return Ok(model),
                    Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            let mut tokens = existing.tokens.0.clone();
            tokens.push(token.to_string());
            let now = Utc::now();
            let changes = ActiveModel {
                tokens: Set(StringList(tokens.clone())),
                expires_at: Set(expires_at),
                used: Set(false),
                updated_at: Set(now),
                ..Default::default()
            };
            if self.write_if_unchanged(&existing, changes).await? {
                return Ok(Model {
                    tokens: StringList(tokens),
                    expires_at,
                    used: false,
                    revision: existing.revision + 1,
                    updated_at: now,
                    ..existing
                });
            }
        }
        Err(DbErr::Custom(format!(
            "invitation tokens for company {} changed concurrently",
            company_id
        )))
    }

    /// Remove `code` if it is live for the company. Returns whether it was.
    ///
    /// Two concurrent calls with the same code never both return `true`.
    pub async fn consume(
        &self,
        company_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(row) = self.find_by_company(company_id).await? else {
                return Ok(false);
            };
            if row.expires_at <= now || !row.tokens.contains(code) {
                return Ok(false);
            }

            let remaining: Vec<String> = row.tokens.iter().filter(|t| *t != code).cloned().collect();
            let changes = ActiveModel {
                tokens: Set(StringList(remaining)),
                updated_at: Set(now),
                ..Default::default()
            };
            if self.write_if_unchanged(&row, changes).await? {
                return Ok(true);
            }
        }
        Err(DbErr::Custom(format!(
            "invitation tokens for company {} changed concurrently",
            company_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::master_db;
    use chrono::Duration;

    #[tokio::test]
    async fn add_token_appends_and_extends_expiry() {
        let db = master_db().await;
        let repo = InvitationTokenRepository::new(&db);
        let company = Uuid::new_v4();
        let first_expiry = Utc::now() + Duration::days(30);
        repo.create(company, "AAAAAAAAAAAA", first_expiry).await.unwrap();

        let later = Utc::now() + Duration::days(60);
        let row = repo.add_token(company, "BBBBBBBBBBBB", later).await.unwrap();
        assert_eq!(row.tokens.0, vec!["AAAAAAAAAAAA", "BBBBBBBBBBBB"]);
        assert!(row.expires_at > first_expiry);
    }

    #[tokio::test]
    async fn consume_removes_only_live_codes() {
        let db = master_db().await;
        let repo = InvitationTokenRepository::new(&db);
        let company = Uuid::new_v4();
        repo.create(company, "CODE00000001", Utc::now() + Duration::days(1))
            .await
            .unwrap();

        assert!(!repo.consume(company, "WRONG", Utc::now()).await.unwrap());
        assert!(repo.consume(company, "CODE00000001", Utc::now()).await.unwrap());
        assert!(!repo.consume(company, "CODE00000001", Utc::now()).await.unwrap());

        let expired = Uuid::new_v4();
        repo.create(expired, "OLD000000001", Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert!(!repo.consume(expired, "OLD000000001", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_consumers_redeem_a_code_once() {
        let db = master_db().await;
        let repo = InvitationTokenRepository::new(&db);
        let company = Uuid::new_v4();
        repo.create(company, "CODE00000001", Utc::now() + Duration::days(1))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            repo.consume(company, "CODE00000001", Utc::now()),
            repo.consume(company, "CODE00000001", Utc::now())
        );

        let redeemed = [a.unwrap(), b.unwrap()];
        assert_eq!(redeemed.iter().filter(|r| **r).count(), 1);
        let row = repo.find_by_company(company).await.unwrap().unwrap();
        assert!(row.tokens.0.is_empty());
    }

    #[tokio::test]
    async fn concurrent_adds_keep_every_code() {
        let db = master_db().await;
        let repo = InvitationTokenRepository::new(&db);
        let company = Uuid::new_v4();
        let expiry = Utc::now() + Duration::days(7);
        repo.create(company, "AAAAAAAAAAAA", expiry).await.unwrap();

        let (a, b) = tokio::join!(
            repo.add_token(company, "BBBBBBBBBBBB", expiry),
            repo.add_token(company, "CCCCCCCCCCCC", expiry)
        );
        a.unwrap();
        b.unwrap();

        let row = repo.find_by_company(company).await.unwrap().unwrap();
        let mut tokens = row.tokens.0;
        tokens.sort();
        assert_eq!(tokens, vec!["AAAAAAAAAAAA", "BBBBBBBBBBBB", "CCCCCCCCCCCC"]);
        assert_eq!(row.revision, 2);
    }

    #[tokio::test]
    async fn stale_revision_write_is_rejected() {
        let db = master_db().await;
        let repo = InvitationTokenRepository::new(&db);
        let company = Uuid::new_v4();
        let stale = repo
            .create(company, "CODE00000001", Utc::now() + Duration::days(1))
            .await
            .unwrap();
        assert!(repo.consume(company, "CODE00000001", Utc::now()).await.unwrap());

        let changes = ActiveModel {
            tokens: Set(StringList(vec!["CODE00000001".to_string()])),
            ..Default::default()
        };
        assert!(!repo.write_if_unchanged(&stale, changes).await.unwrap());
    }
}
