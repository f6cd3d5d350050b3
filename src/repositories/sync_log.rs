//! Sync log repository
//!
//! Sync logs are append-only: there is no update path. Window statistics are
//! always computed from log timestamps.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use super::db_time;
use crate::models::sync_log::{ActiveModel, Column, Entity, Model};
use crate::models::{SyncStatus, SyncType};

/// Fields of a finished sync run.
#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub integration_id: Uuid,
    pub org_id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_processed: u64,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error_detail: Option<JsonValue>,
}

/// Success and failure counts within one time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure share in `[0, 1]`; zero for an empty window.
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failures as f64 / total as f64,
        }
    }
}

/// Repository for sync log database operations
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncLogRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: NewSyncLog) -> Result<Model, DbErr> {
        let duration_ms = (new.finished_at - new.started_at).num_milliseconds().max(0);

        let log = ActiveModel {
            id: Set(Uuid::new_v4()),
            integration_id: Set(new.integration_id),
            org_id: Set(new.org_id),
            sync_type: Set(new.sync_type.as_str().to_string()),
            status: Set(new.status.as_str().to_string()),
            started_at: Set(db_time(new.started_at)),
            finished_at: Set(db_time(new.finished_at)),
            duration_ms: Set(duration_ms),
            records_processed: Set(i64::try_from(new.records_processed).unwrap_or(i64::MAX)),
            attempts: Set(i32::try_from(new.attempts).unwrap_or(i32::MAX)),
            error_kind: Set(new.error_kind),
            error_detail: Set(new.error_detail),
        };

        log.insert(&*self.db).await
    }

    /// Newest-first logs for one integration within an organization.
    pub async fn list_for_integration(
        &self,
        org_id: Uuid,
        integration_id: Uuid,
        limit: u64,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::OrgId.eq(org_id))
            .filter(Column::IntegrationId.eq(integration_id))
            .order_by_desc(Column::FinishedAt)
            .limit(limit)
            .all(&*self.db)
            .await
    }

    /// Newest-first failed logs across an organization.
    pub async fn recent_failures(&self, org_id: Uuid, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::OrgId.eq(org_id))
            .filter(Column::Status.eq(SyncStatus::Failed.as_str()))
            .order_by_desc(Column::FinishedAt)
            .limit(limit)
            .all(&*self.db)
            .await
    }

    pub async fn latest(&self, integration_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .order_by_desc(Column::FinishedAt)
            .one(&*self.db)
            .await
    }

    pub async fn latest_with_status(
        &self,
        integration_id: Uuid,
        status: SyncStatus,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .filter(Column::Status.eq(status.as_str()))
            .order_by_desc(Column::FinishedAt)
            .one(&*self.db)
            .await
    }

    /// Failures recorded after the most recent success.
    pub async fn consecutive_failures(&self, integration_id: Uuid) -> Result<u64, DbErr> {
        let mut query = Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .filter(Column::Status.eq(SyncStatus::Failed.as_str()));

        if let Some(success) = self
            .latest_with_status(integration_id, SyncStatus::Completed)
            .await?
        {
            query = query.filter(Column::FinishedAt.gt(success.finished_at));
        }

        query.count(&*self.db).await
    }

    /// Outcome counts for logs finished at or after `since`.
    pub async fn window_counts(
        &self,
        integration_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<WindowCounts, DbErr> {
        let count_with = |status: SyncStatus| {
            Entity::find()
                .filter(Column::IntegrationId.eq(integration_id))
                .filter(Column::Status.eq(status.as_str()))
                .filter(Column::FinishedAt.gte(db_time(since)))
                .count(&*self.db)
        };

        Ok(WindowCounts {
            successes: count_with(SyncStatus::Completed).await?,
            failures: count_with(SyncStatus::Failed).await?,
        })
    }

    /// Mean duration over the `window` most recent logs.
    pub async fn average_duration_ms(
        &self,
        integration_id: Uuid,
        window: u64,
    ) -> Result<Option<i64>, DbErr> {
        let durations: Vec<i64> = Entity::find()
            .select_only()
            .column(Column::DurationMs)
            .filter(Column::IntegrationId.eq(integration_id))
            .order_by_desc(Column::FinishedAt)
            .limit(window)
            .into_tuple()
            .all(&*self.db)
            .await?;

        if durations.is_empty() {
            return Ok(None);
        }
        let total: i64 = durations.iter().sum();
        Ok(Some(total / durations.len() as i64))
    }

    pub async fn count_for_integration(&self, integration_id: Uuid) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .count(&*self.db)
            .await
    }
}
