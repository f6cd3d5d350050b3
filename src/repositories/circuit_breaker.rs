//! Circuit breaker state repository
//!
//! Reads for update take a row lock so concurrent writers serialise on the
//! breaker row (Postgres `FOR UPDATE`; SQLite serialises writers already).

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect,
    Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::circuit_breaker_state::{ActiveModel, Column, Entity, Model};

/// Repository for circuit breaker state
#[derive(Debug, Clone)]
pub struct CircuitBreakerRepository {
    db: Arc<DatabaseConnection>,
}

impl CircuitBreakerRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn find(&self, integration_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(integration_id).one(&*self.db).await
    }

    /// Load the breaker row with an exclusive row lock held until `conn`
    /// (a transaction) ends.
    pub async fn find_for_update<C: ConnectionTrait>(
        conn: &C,
        integration_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .lock_exclusive()
            .one(conn)
            .await
    }

    /// Insert or overwrite the breaker row for an integration.
    pub async fn upsert<C: ConnectionTrait>(conn: &C, model: Model) -> Result<(), DbErr> {
        let active = ActiveModel {
            integration_id: Set(model.integration_id),
            org_id: Set(model.org_id),
            state: Set(model.state),
            consecutive_failures: Set(model.consecutive_failures),
            opened_at: Set(model.opened_at),
            updated_at: Set(model.updated_at),
        };

        Entity::insert(active)
            .on_conflict(
                OnConflict::column(Column::IntegrationId)
                    .update_columns([
                        Column::State,
                        Column::ConsecutiveFailures,
                        Column::OpenedAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, integration_id: Uuid) -> Result<(), DbErr> {
        Entity::delete_by_id(integration_id).exec(&*self.db).await?;
        Ok(())
    }
}
