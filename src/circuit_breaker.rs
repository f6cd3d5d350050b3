//! Per-integration circuit breaker.
//!
//! [`BreakerSnapshot`] is the pure state machine; [`CircuitBreaker`] persists
//! it per integration and performs every read-modify-write inside a
//! transaction holding the breaker row lock, so counters stay correct across
//! restarts and multiple instances.
//!
//! The breaker sees one outcome per sync run. Retries inside the retry
//! executor never reach it individually.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{DbErr, TransactionTrait};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{BreakerConfig, ConfigError, MAX_PERIOD_SECONDS};
use crate::error::IntegrationError;
use crate::models::BreakerState;
use crate::models::circuit_breaker_state::Model as BreakerRow;
use crate::repositories::{CircuitBreakerRepository, IntegrationRepository, db_time};

/// Thresholds driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_period: chrono::Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_period: chrono::Duration::minutes(10),
        }
    }
}

impl TryFrom<&BreakerConfig> for BreakerSettings {
    type Error = ConfigError;

    fn try_from(config: &BreakerConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        let reset_period = i64::try_from(config.reset_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or(ConfigError::InvalidBreakerReset {
                value: config.reset_seconds,
                max: MAX_PERIOD_SECONDS,
            })?;
        Ok(Self {
            failure_threshold: config.failure_threshold,
            reset_period,
        })
    }
}

/// Breaker state for one integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self::closed()
    }
}

impl BreakerSnapshot {
    pub fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Apply the time-driven `open -> half_open` transition.
    pub fn refreshed(self, settings: &BreakerSettings, now: DateTime<Utc>) -> Self {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) if now - opened_at >= settings.reset_period => {
                Self {
                    state: BreakerState::HalfOpen,
                    ..self
                }
            }
            // An open breaker without an opening time cannot age out; restart it.
            (BreakerState::Open, None) => Self {
                opened_at: Some(now),
                ..self
            },
            _ => self,
        }
    }

    /// Time left before an open breaker admits a trial; `None` when calls pass.
    pub fn rejection(&self, settings: &BreakerSettings, now: DateTime<Utc>) -> Option<Duration> {
        if self.state != BreakerState::Open {
            return None;
        }
        let remaining = self
            .opened_at
            .map(|opened_at| opened_at + settings.reset_period - now)
            .unwrap_or(settings.reset_period);
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    /// Any success closes the breaker and clears the failure count.
    pub fn record_success(self) -> Self {
        Self::closed()
    }

    pub fn record_failure(self, settings: &BreakerSettings, now: DateTime<Utc>) -> Self {
        let consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::HalfOpen | BreakerState::Open => Self {
                state: BreakerState::Open,
                consecutive_failures,
                opened_at: Some(now),
            },
            BreakerState::Closed if consecutive_failures >= settings.failure_threshold => Self {
                state: BreakerState::Open,
                consecutive_failures,
                opened_at: Some(now),
            },
            BreakerState::Closed => Self {
                consecutive_failures,
                ..self
            },
        }
    }

    fn from_row(row: &BreakerRow) -> Self {
        let state = row.state.parse().unwrap_or_else(|err| {
            warn!(integration_id = %row.integration_id, error = %err, "Unreadable breaker state; treating as closed");
            BreakerState::Closed
        });
        Self {
            state,
            consecutive_failures: u32::try_from(row.consecutive_failures).unwrap_or(0),
            opened_at: row.opened_at.map(|dt| dt.with_timezone(&Utc)),
        }
    }

    fn to_row(self, integration_id: Uuid, org_id: Uuid, now: DateTime<Utc>) -> BreakerRow {
        BreakerRow {
            integration_id,
            org_id,
            state: self.state.as_str().to_string(),
            consecutive_failures: i32::try_from(self.consecutive_failures).unwrap_or(i32::MAX),
            opened_at: self.opened_at.map(db_time),
            updated_at: db_time(now),
        }
    }
}

/// Persisted circuit breaker shared by every sync of every integration.
#[derive(Clone)]
pub struct CircuitBreaker {
    repo: CircuitBreakerRepository,
    settings: BreakerSettings,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(repo: CircuitBreakerRepository, settings: BreakerSettings, clock: SharedClock) -> Self {
        Self {
            repo,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state with the reset-period transition applied, without
    /// persisting it.
    pub async fn snapshot(&self, integration_id: Uuid) -> Result<BreakerSnapshot, DbErr> {
        let stored = self
            .repo
            .find(integration_id)
            .await?
            .map(|row| BreakerSnapshot::from_row(&row))
            .unwrap_or_default();
        Ok(stored.refreshed(&self.settings, self.clock.now()))
    }

    /// Admit or reject a sync. Persists `open -> half_open` when the reset
    /// period has elapsed.
    pub async fn check(&self, integration_id: Uuid, org_id: Uuid) -> Result<(), IntegrationError> {
        let now = self.clock.now();
        let txn = self.repo.connection().begin().await?;

        let stored = CircuitBreakerRepository::find_for_update(&txn, integration_id)
            .await?
            .map(|row| BreakerSnapshot::from_row(&row));
        let current = stored.unwrap_or_default();
        let refreshed = current.refreshed(&self.settings, now);

        if stored.is_some() && refreshed != current {
            CircuitBreakerRepository::upsert(&txn, refreshed.to_row(integration_id, org_id, now))
                .await?;
            log_transition(integration_id, current.state, refreshed.state);
        }
        txn.commit().await?;

        match refreshed.rejection(&self.settings, now) {
            Some(remaining) => {
                counter!("circuit_breaker_rejections_total").increment(1);
                Err(IntegrationError::CircuitOpen {
                    integration_id,
                    retry_after_seconds: remaining.as_secs().max(1),
                })
            }
            None => Ok(()),
        }
    }

    /// Feed one terminal sync outcome to the breaker.
    ///
    /// Nothing is persisted once the integration row is gone, so a sync that
    /// finishes after a delete leaves no breaker state behind.
    pub async fn record_outcome(
        &self,
        integration_id: Uuid,
        org_id: Uuid,
        success: bool,
    ) -> Result<BreakerSnapshot, DbErr> {
        let now = self.clock.now();
        let txn = self.repo.connection().begin().await?;

        if IntegrationRepository::find_for_share(&txn, integration_id)
            .await?
            .is_none()
        {
            txn.rollback().await?;
            debug!(integration_id = %integration_id, "Integration deleted; outcome not recorded");
            return Ok(BreakerSnapshot::closed());
        }

        let current = CircuitBreakerRepository::find_for_update(&txn, integration_id)
            .await?
            .map(|row| BreakerSnapshot::from_row(&row))
            .unwrap_or_default()
            .refreshed(&self.settings, now);

        let next = if success {
            current.record_success()
        } else {
            current.record_failure(&self.settings, now)
        };

        CircuitBreakerRepository::upsert(&txn, next.to_row(integration_id, org_id, now)).await?;
        txn.commit().await?;

        if next.state != current.state {
            log_transition(integration_id, current.state, next.state);
        }
        Ok(next)
    }

    /// Drop persisted state, e.g. when the integration is deleted.
    pub async fn remove(&self, integration_id: Uuid) -> Result<(), DbErr> {
        self.repo.delete(integration_id).await
    }
}

fn log_transition(integration_id: Uuid, from: BreakerState, to: BreakerState) {
    counter!("circuit_breaker_transitions_total", "to" => to.as_str()).increment(1);
    match to {
        BreakerState::Open => {
            warn!(integration_id = %integration_id, from = %from, "Circuit breaker opened")
        }
        _ => info!(integration_id = %integration_id, from = %from, to = %to, "Circuit breaker transition"),
    }
}
