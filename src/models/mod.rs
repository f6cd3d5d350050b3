//! # Data Models
//!
//! SeaORM entities for integrations and their resilience state, plus the
//! string-backed enums stored in their status columns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod circuit_breaker_state;
pub mod credentials;
pub mod health_record;
pub mod integration;
pub mod oauth_session;
pub mod sync_log;

pub use circuit_breaker_state::Entity as CircuitBreakerState;
pub use credentials::{Credentials, IntegrationConfig};
pub use health_record::Entity as HealthRecord;
pub use integration::Entity as Integration;
pub use oauth_session::Entity as OAuthSession;
pub use sync_log::Entity as SyncLog;

/// Error returned when a stored string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Value persisted in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// External systems an integration can connect to.
    ProviderType, "provider type" {
        Github => "github",
        Gitlab => "gitlab",
        Jira => "jira",
        GoogleWorkspace => "google_workspace",
        Okta => "okta",
        Aws => "aws",
    }
}

string_enum! {
    /// Lifecycle status of an integration.
    IntegrationStatus, "integration status" {
        Active => "active",
        Inactive => "inactive",
        Error => "error",
        Syncing => "syncing",
    }
}

string_enum! {
    /// What triggered a sync and how much it pulls.
    SyncType, "sync type" {
        Manual => "manual",
        Scheduled => "scheduled",
        Full => "full",
        Incremental => "incremental",
    }
}

string_enum! {
    /// Terminal status recorded on a sync log.
    SyncStatus, "sync status" {
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    /// Circuit breaker states.
    BreakerState, "breaker state" {
        Closed => "closed",
        Open => "open",
        HalfOpen => "half_open",
    }
}

string_enum! {
    /// Human-facing health classification.
    HealthStatus, "health status" {
        Healthy => "healthy",
        Degraded => "degraded",
        Unhealthy => "unhealthy",
        Unknown => "unknown",
    }
}

impl HealthStatus {
    /// Ordering used when rolling several integrations into one status;
    /// higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}
