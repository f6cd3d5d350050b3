//! Sync log entity model
//!
//! Append-only record of one sync run after all internal retries.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub integration_id: Uuid,

    pub org_id: Uuid,

    /// manual | scheduled | full | incremental
    pub sync_type: String,

    /// completed | failed
    pub status: String,

    pub started_at: DateTimeWithTimeZone,

    pub finished_at: DateTimeWithTimeZone,

    pub duration_ms: i64,

    pub records_processed: i64,

    /// Provider attempts consumed, including an auth refresh retry
    pub attempts: i32,

    /// Classified error kind for failed runs
    pub error_kind: Option<String>,

    /// Structured error detail: message, kind, attempts, provider detail
    #[sea_orm(column_type = "JsonBinary")]
    pub error_detail: Option<JsonValue>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn error_message(&self) -> Option<&str> {
        self.error_detail
            .as_ref()
            .and_then(|detail| detail.get("message"))
            .and_then(JsonValue::as_str)
    }
}
