//! # Slack Repositories
//!
//! OAuth install states and installed workspaces, both in the master database.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    Unchanged,
};
use uuid::Uuid;

use crate::models::StringList;
use crate::models::master::{slack_install_state, slack_workspace};

/// Repository for short-lived OAuth `state` values
pub struct SlackInstallStateRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> SlackInstallStateRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Store a state that expires after `ttl`
    pub async fn create(
        &self,
        company_id: Uuid,
        state: &str,
        ttl: Duration,
    ) -> Result<slack_install_state::Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = slack_install_state::Model {
            id: Uuid::new_v4(),
            company_id,
            state: state.to_string(),
            expires_at: now + ttl,
            created_at: now,
        };
        slack_install_state::Entity::insert(slack_install_state::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    /// Delete the state if it belongs to the company and is unexpired.
    ///
    /// Returns `true` only when a live state was consumed.
    pub async fn consume(
        &self,
        company_id: Uuid,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sea_orm::DbErr> {
        let found = slack_install_state::Entity::find()
            .filter(slack_install_state::Column::CompanyId.eq(company_id))
            .filter(slack_install_state::Column::State.eq(state))
            .one(self.db)
            .await?;

        match found {
            Some(row) if !row.is_expired(now) => {
                // A concurrent install may have deleted it first.
                let deleted = slack_install_state::Entity::delete_by_id(row.id)
                    .exec(self.db)
                    .await?;
                Ok(deleted.rows_affected == 1)
            }
            _ => Ok(false),
        }
    }
}

/// Repository for installed Slack workspaces
pub struct SlackWorkspaceRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> SlackWorkspaceRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert the workspace, or refresh bot user and scopes on reinstall
    pub async fn upsert(
        &self,
        company_id: Uuid,
        team_id: &str,
        bot_user_id: Option<String>,
        scopes: Vec<String>,
    ) -> Result<slack_workspace::Model, sea_orm::DbErr> {
        let now = Utc::now();
        if let Some(existing) = self.find_by_team_id(team_id).await? {
            return slack_workspace::ActiveModel {
                id: Unchanged(existing.id),
                tenant_id: Set(company_id),
                bot_user_id: Set(bot_user_id),
                scopes: Set(StringList(scopes)),
                installed_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .update(self.db)
            .await;
        }

        let model = slack_workspace::Model {
            id: Uuid::new_v4(),
            tenant_id: company_id,
            team_id: team_id.to_string(),
            bot_user_id,
            scopes: StringList(scopes),
            installed_at: now,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        };
        slack_workspace::Entity::insert(slack_workspace::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find_by_team_id(
        &self,
        team_id: &str,
    ) -> Result<Option<slack_workspace::Model>, sea_orm::DbErr> {
        slack_workspace::Entity::find()
            .filter(slack_workspace::Column::TeamId.eq(team_id))
            .one(self.db)
            .await
    }

    pub async fn list(&self) -> Result<Vec<slack_workspace::Model>, sea_orm::DbErr> {
        slack_workspace::Entity::find()
            .order_by_asc(slack_workspace::Column::CreatedAt)
            .all(self.db)
            .await
    }

    /// Record a completed message sync
    pub async fn mark_synced(&self, team_id: &str, at: DateTime<Utc>) -> Result<(), sea_orm::DbErr> {
        slack_workspace::Entity::update_many()
            .col_expr(slack_workspace::Column::LastSyncAt, sea_orm::sea_query::Expr::value(at))
            .col_expr(slack_workspace::Column::UpdatedAt, sea_orm::sea_query::Expr::value(at))
            .filter(slack_workspace::Column::TeamId.eq(team_id))
            .exec(self.db)
            .await?;
        Ok(())
    }
}
