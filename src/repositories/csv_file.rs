//! # CSV File Repository
//!
//! Uploaded source files and their indexing status.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    Unchanged,
};
use uuid::Uuid;

use crate::models::tenant::csv_file::{
    ActiveModel, Column, Entity, Model, STATUS_INDEXED, STATUS_UPLOADED,
};

pub struct CsvFileRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> CsvFileRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Record a blob in the `uploaded` state
    pub async fn create(
        &self,
        company_id: Uuid,
        file_name: &str,
        size: i64,
        blob_url: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Model, sea_orm::DbErr> {
        let model = Model {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            size,
            uploaded_at,
            blob_url: blob_url.to_string(),
            status: STATUS_UPLOADED.to_string(),
            company_id,
        };
        Entity::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.db)
            .await?;
        Ok(model)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(id).one(self.db).await
    }

    pub async fn exists_with_url(&self, blob_url: &str) -> Result<bool, sea_orm::DbErr> {
        Ok(Entity::find()
            .filter(Column::BlobUrl.eq(blob_url))
            .one(self.db)
            .await?
            .is_some())
    }

    pub async fn find_by_url(
        &self,
        company_id: Uuid,
        blob_url: &str,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::CompanyId.eq(company_id))
            .filter(Column::BlobUrl.eq(blob_url))
            .one(self.db)
            .await
    }

    /// Files for a company, newest upload first
    pub async fn list(&self, company_id: Uuid) -> Result<Vec<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::CompanyId.eq(company_id))
            .order_by_desc(Column::UploadedAt)
            .all(self.db)
            .await
    }

    pub async fn mark_indexed(&self, id: Uuid) -> Result<Model, sea_orm::DbErr> {
        ActiveModel {
            id: Unchanged(id),
            status: Set(STATUS_INDEXED.to_string()),
            ..Default::default()
        }
        .update(self.db)
        .await
    }

    /// Move every file back to `uploaded`. Returns the number of rows touched.
    pub async fn reset_all(&self) -> Result<u64, sea_orm::DbErr> {
        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                sea_orm::sea_query::Expr::value(STATUS_UPLOADED),
            )
            .exec(self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), sea_orm::DbErr> {
        Entity::delete_by_id(id).exec(self.db).await?;
        Ok(())
    }
}
