//! Integration entity model
//!
//! One configured connection from an organization to an external provider.
//! The configuration blob is stored only as vault ciphertext.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{IntegrationStatus, ProviderType, UnknownVariant};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning organization; every query is scoped by it
    pub org_id: Uuid,

    /// Provider type (see [`ProviderType`])
    pub provider_type: String,

    /// Display name chosen by the user
    pub name: String,

    /// Sealed [`super::IntegrationConfig`]
    pub config_ciphertext: Vec<u8>,

    /// active | inactive | error | syncing
    pub status: String,

    /// Expected sync cadence; `None` means on-demand only
    pub sync_interval_seconds: Option<i64>,

    /// Per-integration override of the default retry policy
    #[sea_orm(column_type = "JsonBinary")]
    pub retry_policy: Option<JsonValue>,

    /// Access token expiry mirrored out of the sealed config for refresh scans
    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// Lease on the `syncing` status so a crashed worker cannot wedge the row
    pub lock_expires_at: Option<DateTimeWithTimeZone>,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn provider(&self) -> Result<ProviderType, UnknownVariant> {
        self.provider_type.parse()
    }

    pub fn status(&self) -> Result<IntegrationStatus, UnknownVariant> {
        self.status.parse()
    }

    pub fn last_sync_at_utc(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at.map(|dt| dt.with_timezone(&Utc))
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at.with_timezone(&Utc)
    }

    /// Additional authenticated data binding ciphertext to this row.
    pub fn credential_aad(&self) -> String {
        credential_aad(self.org_id, &self.provider_type, self.id)
    }
}

/// AAD format shared by every sealed integration config.
pub fn credential_aad(org_id: Uuid, provider_type: &str, integration_id: Uuid) -> String {
    format!("{}|{}|{}", org_id, provider_type, integration_id)
}
