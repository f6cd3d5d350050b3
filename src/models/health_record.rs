//! Health record entity model
//!
//! Derived per-integration metrics, recomputed from sync logs after every
//! sync log write.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "health_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub integration_id: Uuid,

    pub org_id: Uuid,

    /// healthy | degraded | unhealthy | unknown
    pub status: String,

    /// improving | stable | degrading
    pub trend: String,

    pub last_success_at: Option<DateTimeWithTimeZone>,

    pub consecutive_failures: i32,

    pub success_count_24h: i32,

    pub failure_count_24h: i32,

    pub success_count_7d: i32,

    pub failure_count_7d: i32,

    pub avg_duration_ms: Option<i64>,

    pub last_error: Option<String>,

    pub last_error_at: Option<DateTimeWithTimeZone>,

    pub computed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
