//! OAuth session entity model
//!
//! Ephemeral state for an in-flight authorization-code grant. Rows are
//! consumed exactly once by the callback or purged after expiry.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub org_id: Uuid,

    pub provider_type: String,

    /// Opaque random state token echoed back by the provider
    #[sea_orm(unique)]
    pub state: String,

    /// Requested scopes as a JSON array of strings
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: JsonValue,

    /// PKCE verifier, present when the provider flow uses PKCE
    pub code_verifier: Option<String>,

    /// Name for the integration created on completion
    pub integration_name: String,

    /// Existing integration being re-authorized, if any
    pub integration_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn scope_list(&self) -> Vec<String> {
        self.scopes
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
