//! # Company Repositories
//!
//! Tenant-database access for the company row, its users and its senpai
//! personas.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    Unchanged,
};
use serde_json::Value;
use uuid::Uuid;

use crate::models::tenant::{company, company_user, senpai};

/// Repository for the tenant `companies` table
pub struct CompanyRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> CompanyRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create the company with an empty prompt template
    pub async fn create(
        &self,
        company_name: &str,
        company_server_name: &str,
    ) -> Result<company::Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = company::Model {
            id: Uuid::new_v4(),
            company_name: company_name.to_string(),
            company_server_name: company_server_name.to_string(),
            prompt_template: String::new(),
            created_at: now,
            updated_at: now,
        };
        company::Entity::insert(company::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<company::Model>, sea_orm::DbErr> {
        company::Entity::find_by_id(id).one(self.db).await
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<company::Model>, sea_orm::DbErr> {
        company::Entity::find()
            .filter(company::Column::CompanyName.eq(name))
            .one(self.db)
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), sea_orm::DbErr> {
        company::Entity::delete_by_id(id).exec(self.db).await?;
        Ok(())
    }

    /// Set the prompt template; an empty string resets it
    pub async fn set_prompt_template(
        &self,
        id: Uuid,
        template: &str,
    ) -> Result<company::Model, sea_orm::DbErr> {
        company::ActiveModel {
            id: Unchanged(id),
            prompt_template: Set(template.to_string()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(self.db)
        .await
    }
}

/// Fields for a newly provisioned user
#[derive(Debug, Clone)]
pub struct NewCompanyUser {
    pub company_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub azure_user_id: String,
}

/// Repository for the tenant `company_users` table
pub struct CompanyUserRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> CompanyUserRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, user: NewCompanyUser) -> Result<company_user::Model, sea_orm::DbErr> {
        let model = company_user::Model {
            id: Uuid::new_v4(),
            company_id: user.company_id,
            email: user.email,
            name: user.name,
            role: user.role,
            azure_user_id: user.azure_user_id,
            created_at: Utc::now(),
        };
        company_user::Entity::insert(company_user::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find_by_azure_id(
        &self,
        azure_user_id: &str,
    ) -> Result<Option<company_user::Model>, sea_orm::DbErr> {
        company_user::Entity::find()
            .filter(company_user::Column::AzureUserId.eq(azure_user_id))
            .one(self.db)
            .await
    }
}

/// Repository for the tenant `senpais` table
pub struct SenpaiRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> SenpaiRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        company_id: Uuid,
        name: &str,
        profile: Value,
    ) -> Result<senpai::Model, sea_orm::DbErr> {
        let model = senpai::Model {
            id: Uuid::new_v4(),
            company_id,
            name: name.to_string(),
            profile,
            created_at: Utc::now(),
        };
        senpai::Entity::insert(senpai::ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn list(&self, company_id: Uuid) -> Result<Vec<senpai::Model>, sea_orm::DbErr> {
        senpai::Entity::find()
            .filter(senpai::Column::CompanyId.eq(company_id))
            .order_by_asc(senpai::Column::CreatedAt)
            .all(self.db)
            .await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<senpai::Model>, sea_orm::DbErr> {
        senpai::Entity::find_by_id(id).one(self.db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tenant_db;
    use serde_json::json;

    #[tokio::test]
    async fn prompt_template_round_trip() {
        let db = tenant_db().await;
        let repo = CompanyRepository::new(&db);
        let company = repo.create("Acme", "acme").await.unwrap();
        assert_eq!(company.prompt_template, "");

        let updated = repo
            .set_prompt_template(company.id, "丁寧に答えてください")
            .await
            .unwrap();
        assert_eq!(updated.prompt_template, "丁寧に答えてください");

        repo.set_prompt_template(company.id, "").await.unwrap();
        let reset = repo.find(company.id).await.unwrap().unwrap();
        assert_eq!(reset.prompt_template, "");
    }

    #[tokio::test]
    async fn user_lookup_by_azure_id() {
        let db = tenant_db().await;
        let company = CompanyRepository::new(&db)
            .create("Acme", "acme")
            .await
            .unwrap();
        let repo = CompanyUserRepository::new(&db);
        let hanako = |company_id| NewCompanyUser {
            company_id,
            email: "hanako@acme.co.jp".into(),
            name: "Hanako".into(),
            role: "company_admin".into(),
            azure_user_id: "oid-1".into(),
        };
        repo.create(hanako(company.id)).await.unwrap();

        let user = repo.find_by_azure_id("oid-1").await.unwrap().unwrap();
        assert!(user.is_admin());
        assert!(repo.find_by_azure_id("oid-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn users_require_an_existing_company() {
        let db = tenant_db().await;
        let result = CompanyUserRepository::new(&db)
            .create(NewCompanyUser {
                company_id: Uuid::new_v4(),
                email: "taro@acme.co.jp".into(),
                name: "Taro".into(),
                role: "user".into(),
                azure_user_id: "oid-3".into(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn senpais_are_listed_per_company() {
        let db = tenant_db().await;
        let repo = SenpaiRepository::new(&db);
        let company_id = Uuid::new_v4();
        let created = repo
            .create(company_id, "Sato", json!({ "team": "infra" }))
            .await
            .unwrap();
        repo.create(Uuid::new_v4(), "Other", json!({})).await.unwrap();

        let listed = repo.list(company_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].profile["team"], "infra");
        assert_eq!(repo.find(created.id).await.unwrap().unwrap().name, "Sato");
    }
}
