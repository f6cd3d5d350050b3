//! Circuit breaker state entity model
//!
//! At most one row per integration, keyed by the integration id.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "circuit_breaker_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub integration_id: Uuid,

    pub org_id: Uuid,

    /// closed | open | half_open
    pub state: String,

    /// Consecutive failed sync outcomes
    pub consecutive_failures: i32,

    /// When the breaker last opened; the reset period counts from here
    pub opened_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
