//! Health record repository

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::health_record::{Column, Entity, Model};

/// Repository for derived health records
#[derive(Debug, Clone)]
pub struct HealthRepository {
    db: Arc<DatabaseConnection>,
}

impl HealthRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert or replace the record keyed by integration id.
    pub async fn upsert(&self, record: Model) -> Result<(), DbErr> {
        Entity::insert(record.into_active_model())
            .on_conflict(
                OnConflict::column(Column::IntegrationId)
                    .update_columns([
                        Column::OrgId,
                        Column::Status,
                        Column::Trend,
                        Column::LastSuccessAt,
                        Column::ConsecutiveFailures,
                        Column::SuccessCount24h,
                        Column::FailureCount24h,
                        Column::SuccessCount7d,
                        Column::FailureCount7d,
                        Column::AvgDurationMs,
                        Column::LastError,
                        Column::LastErrorAt,
                        Column::ComputedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn find_for_org(
        &self,
        org_id: Uuid,
        integration_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .filter(Column::OrgId.eq(org_id))
            .one(&*self.db)
            .await
    }

    pub async fn list_by_org(&self, org_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::OrgId.eq(org_id))
            .order_by_asc(Column::IntegrationId)
            .all(&*self.db)
            .await
    }

    pub async fn delete(&self, integration_id: Uuid) -> Result<(), DbErr> {
        Entity::delete_by_id(integration_id).exec(&*self.db).await?;
        Ok(())
    }
}
