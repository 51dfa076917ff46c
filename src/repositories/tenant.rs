//! # Tenant Repository
//!
//! Master-database registry of companies and the servers holding their data.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    Unchanged,
};
use uuid::Uuid;

use crate::models::StringList;
use crate::models::master::tenant::{ActiveModel, Column, Entity, Model};

/// Repository for the master `tenants` table
pub struct TenantRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> TenantRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Register a company with no allowed domains
    pub async fn create(
        &self,
        company_name: &str,
        company_id: Uuid,
        company_server_name: &str,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            company_name: company_name.to_string(),
            company_id,
            company_server_name: company_server_name.to_string(),
            allowed_domains: StringList::default(),
            created_at: now,
            updated_at: now,
        };

        Entity::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find_by_company_id(&self, company_id: Uuid) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::CompanyId.eq(company_id))
            .one(self.db)
            .await
    }

    pub async fn find_by_company_name(&self, name: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::CompanyName.eq(name))
            .one(self.db)
            .await
    }

    pub async fn find_by_server_name(&self, server: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::CompanyServerName.eq(server))
            .one(self.db)
            .await
    }

    /// All tenants, oldest first
    pub async fn list(&self) -> Result<Vec<Model>, sea_orm::DbErr> {
        Entity::find()
            .order_by_asc(Column::CreatedAt)
            .all(self.db)
            .await
    }

    /// Replace the allowed e-mail domains
    pub async fn set_allowed_domains(
        &self,
        tenant: &Model,
        domains: Vec<String>,
    ) -> Result<Model, sea_orm::DbErr> {
        ActiveModel {
            id: Unchanged(tenant.id),
            allowed_domains: Set(StringList(domains)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(self.db)
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), sea_orm::DbErr> {
        Entity::delete_by_id(id).exec(self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::master_db;

    #[tokio::test]
    async fn create_and_lookup() {
        let db = master_db().await;
        let repo = TenantRepository::new(&db);
        let company_id = Uuid::new_v4();
        repo.create("Acme", company_id, "acme-db").await.unwrap();

        let found = repo.find_by_company_id(company_id).await.unwrap().unwrap();
        assert_eq!(found.company_server_name, "acme-db");
        assert!(found.allowed_domains.0.is_empty());
        assert!(repo.find_by_company_name("Acme").await.unwrap().is_some());
        assert!(repo.find_by_server_name("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_server_name_is_rejected() {
        let db = master_db().await;
        let repo = TenantRepository::new(&db);
        repo.create("Acme", Uuid::new_v4(), "shared").await.unwrap();

        let err = repo.create("Beta", Uuid::new_v4(), "shared").await.unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn replaces_allowed_domains() {
        let db = master_db().await;
        let repo = TenantRepository::new(&db);
        let tenant = repo.create("Acme", Uuid::new_v4(), "acme").await.unwrap();

        let updated = repo
            .set_allowed_domains(&tenant, vec!["@acme.co.jp".to_string()])
            .await
            .unwrap();
        assert_eq!(updated.allowed_domains.0, vec!["@acme.co.jp".to_string()]);
    }
}
