//! Database migrations for the integrations service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000001_create_integrations;
mod m2025_11_10_000002_create_oauth_sessions;
mod m2025_11_10_000003_create_sync_logs;
mod m2025_11_10_000004_create_circuit_breaker_states;
mod m2025_11_10_000005_create_health_records;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000001_create_integrations::Migration),
            Box::new(m2025_11_10_000002_create_oauth_sessions::Migration),
            Box::new(m2025_11_10_000003_create_sync_logs::Migration),
            Box::new(m2025_11_10_000004_create_circuit_breaker_states::Migration),
            Box::new(m2025_11_10_000005_create_health_records::Migration),
        ]
    }
}
