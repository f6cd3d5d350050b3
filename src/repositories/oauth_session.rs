//! # OAuth Session Repository
//!
//! Sessions are single use: [`OAuthSessionRepository::consume`] reads and
//! deletes the row inside one transaction and only reports success when this
//! caller's delete removed it.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

use super::db_time;
use crate::models::ProviderType;
use crate::models::oauth_session::{ActiveModel, Column, Entity, Model};

/// Fields required to open an authorization session.
#[derive(Debug, Clone)]
pub struct NewOAuthSession {
    pub org_id: Uuid,
    pub provider: ProviderType,
    pub state: String,
    pub scopes: Vec<String>,
    pub code_verifier: Option<String>,
    pub integration_name: String,
    pub integration_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

/// Repository for OAuth session database operations
#[derive(Debug, Clone)]
pub struct OAuthSessionRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthSessionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewOAuthSession, now: DateTime<Utc>) -> Result<Model, DbErr> {
        let session = ActiveModel {
            id: Set(Uuid::new_v4()),
            org_id: Set(new.org_id),
            provider_type: Set(new.provider.as_str().to_string()),
            state: Set(new.state),
            scopes: Set(serde_json::json!(new.scopes)),
            code_verifier: Set(new.code_verifier),
            integration_name: Set(new.integration_name),
            integration_id: Set(new.integration_id),
            created_at: Set(db_time(now)),
            expires_at: Set(db_time(new.expires_at)),
        };

        session.insert(&*self.db).await
    }

    /// Atomically consume an unexpired session by state token.
    ///
    /// Returns `None` when the state is unknown, expired or was consumed by a
    /// concurrent caller.
    pub async fn consume(&self, state: &str, now: DateTime<Utc>) -> Result<Option<Model>, DbErr> {
        let txn = self.db.begin().await?;

        let Some(session) = Entity::find()
            .filter(Column::State.eq(state))
            .filter(Column::ExpiresAt.gt(db_time(now)))
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(None);
        };

        let deleted = Entity::delete_many()
            .filter(Column::Id.eq(session.id))
            .filter(Column::ExpiresAt.gt(db_time(now)))
            .exec(&txn)
            .await?;

        if deleted.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(None);
        }

        txn.commit().await?;
        Ok(Some(session))
    }

    /// Delete sessions past their expiry. Returns the number removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::ExpiresAt.lte(db_time(now)))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }

    /// Remove an expired session that a callback presented, so stale state
    /// does not linger until the next cleanup.
    pub async fn delete_by_state(&self, state: &str) -> Result<bool, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::State.eq(state))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
