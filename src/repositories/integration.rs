//! Integration repository
//!
//! Besides plain CRUD this owns the persisted half of the per-integration sync
//! lock: a conditional transition to `syncing` guarded by a lease.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone as DateTimeWithTz;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use super::db_time;
use crate::models::integration::{ActiveModel, Column, Entity, Model};
use crate::models::{IntegrationStatus, ProviderType};

/// Fields required to create an integration row.
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub id: Uuid,
    pub org_id: Uuid,
    pub provider: ProviderType,
    pub name: String,
    pub config_ciphertext: Vec<u8>,
    pub sync_interval_seconds: Option<i64>,
    pub retry_policy: Option<JsonValue>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Repository for integration database operations
#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    db: Arc<DatabaseConnection>,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewIntegration, now: DateTime<Utc>) -> Result<Model, DbErr> {
        let model = ActiveModel {
            id: Set(new.id),
            org_id: Set(new.org_id),
            provider_type: Set(new.provider.as_str().to_string()),
            name: Set(new.name),
            config_ciphertext: Set(new.config_ciphertext),
            status: Set(IntegrationStatus::Active.as_str().to_string()),
            sync_interval_seconds: Set(new.sync_interval_seconds),
            retry_policy: Set(new.retry_policy),
            token_expires_at: Set(new.token_expires_at.map(db_time)),
            lock_expires_at: Set(None),
            last_sync_at: Set(None),
            last_error: Set(None),
            created_at: Set(db_time(now)),
            updated_at: Set(db_time(now)),
        };

        model.insert(&*self.db).await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&*self.db).await
    }

    /// Organization-scoped lookup.
    pub async fn find_for_org(&self, org_id: Uuid, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::Id.eq(id))
            .filter(Column::OrgId.eq(org_id))
            .one(&*self.db)
            .await
    }

    pub async fn list_by_org(&self, org_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::OrgId.eq(org_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&*self.db)
            .await
    }

    /// Active integrations that declare a sync cadence.
    /// Load the integration row with a shared row lock held until `conn`
    /// (a transaction) ends, so a concurrent delete waits for the caller.
    pub async fn find_for_share<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::Id.eq(id))
            .lock_shared()
            .one(conn)
            .await
    }

    pub async fn list_with_cadence(&self) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(IntegrationStatus::Active.as_str()))
            .filter(Column::SyncIntervalSeconds.is_not_null())
            .order_by_asc(Column::LastSyncAt)
            .all(&*self.db)
            .await
    }

    /// Active integrations whose access token expires at or before `before`.
    pub async fn list_expiring_tokens(&self, before: DateTime<Utc>) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(IntegrationStatus::Active.as_str()))
            .filter(Column::TokenExpiresAt.is_not_null())
            .filter(Column::TokenExpiresAt.lte(db_time(before)))
            .order_by_asc(Column::TokenExpiresAt)
            .all(&*self.db)
            .await
    }

    /// Compare-and-set the integration into `syncing`.
    ///
    /// Succeeds only from `active`, or from a `syncing` row whose lease has
    /// lapsed. Returns whether this caller won the transition.
    pub async fn try_mark_syncing(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let stale_lease = Condition::all()
            .add(Column::Status.eq(IntegrationStatus::Syncing.as_str()))
            .add(
                Condition::any()
                    .add(Column::LockExpiresAt.is_null())
                    .add(Column::LockExpiresAt.lt(db_time(now))),
            );

        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(IntegrationStatus::Syncing.as_str()),
            )
            .col_expr(Column::LockExpiresAt, Expr::value(db_time(lease_until)))
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(Column::Status.eq(IntegrationStatus::Active.as_str()))
                    .add(stale_lease),
            )
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Record the terminal outcome of a sync and drop the lease.
    ///
    /// The row returns to `active` only if it is still `syncing`; a status
    /// change made while the sync ran wins.
    pub async fn finish_sync(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::LastSyncAt, Expr::value(db_time(now)))
            .col_expr(Column::LastError, Expr::value(last_error))
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;

        self.release_lock(id, now).await
    }

    /// Return a `syncing` row to `active` without touching sync fields.
    pub async fn release_lock(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(IntegrationStatus::Active.as_str()))
            .col_expr(Column::LockExpiresAt, Expr::value(Option::<DateTimeWithTz>::None))
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(IntegrationStatus::Syncing.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Block further syncs until the user re-authorizes.
    pub async fn mark_error(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(IntegrationStatus::Error.as_str()))
            .col_expr(Column::LastError, Expr::value(message))
            .col_expr(Column::LockExpiresAt, Expr::value(Option::<DateTimeWithTz>::None))
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Replace the sealed configuration after a token refresh.
    pub async fn update_config(
        &self,
        id: Uuid,
        config_ciphertext: Vec<u8>,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::ConfigCiphertext, Expr::value(config_ciphertext))
            .col_expr(
                Column::TokenExpiresAt,
                Expr::value(token_expires_at.map(db_time)),
            )
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Store fresh credentials from a completed authorization and clear any
    /// re-authorization block.
    pub async fn reauthorize(
        &self,
        id: Uuid,
        config_ciphertext: Vec<u8>,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, DbErr> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let status = match existing.status() {
            Ok(IntegrationStatus::Error) => IntegrationStatus::Active,
            Ok(status) => status,
            Err(_) => IntegrationStatus::Active,
        };

        let mut model: ActiveModel = existing.into();
        model.config_ciphertext = Set(config_ciphertext);
        model.token_expires_at = Set(token_expires_at.map(db_time));
        model.status = Set(status.as_str().to_string());
        model.last_error = Set(None);
        model.updated_at = Set(db_time(now));

        model.update(&*self.db).await.map(Some)
    }

    /// Set a user-controlled status. Rows that are mid-sync are left alone.
    pub async fn set_status(
        &self,
        org_id: Uuid,
        id: Uuid,
        status: IntegrationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(db_time(now)))
            .filter(Column::Id.eq(id))
            .filter(Column::OrgId.eq(org_id))
            .filter(Column::Status.ne(IntegrationStatus::Syncing.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn delete(&self, org_id: Uuid, id: Uuid) -> Result<bool, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::OrgId.eq(org_id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
