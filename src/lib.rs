//! # Integrations
//!
//! Resilience core for third-party integrations: OAuth onboarding, encrypted
//! credential storage, retried and circuit-broken syncs, and health
//! aggregation per integration and organization.

pub mod app;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod health;
pub mod locks;
pub mod models;
pub mod oauth;
pub mod providers;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod sync;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
