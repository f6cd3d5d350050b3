//! # Repository Layer
//!
//! Repositories encapsulate SeaORM operations for each entity. Every query that
//! reads user-facing data is scoped by organization.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;

pub mod circuit_breaker;
pub mod health;
pub mod integration;
pub mod oauth_session;
pub mod sync_log;

pub use circuit_breaker::CircuitBreakerRepository;
pub use health::HealthRepository;
pub use integration::{IntegrationRepository, NewIntegration};
pub use oauth_session::{NewOAuthSession, OAuthSessionRepository};
pub use sync_log::{NewSyncLog, SyncLogRepository, WindowCounts};

/// Timestamps are stored with an explicit UTC offset.
pub(crate) fn db_time(value: DateTime<Utc>) -> DateTimeWithTimeZone {
    value.fixed_offset()
}
