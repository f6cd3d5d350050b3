//! # Health Aggregator
//!
//! Turns raw sync logs into a status a human can trust. Every figure is
//! recomputed from sync log timestamps; there are no incrementally mutated
//! counters to drift.
//!
//! Status rules, first match wins:
//! 1. `unknown` when the integration has no sync log
//! 2. `unhealthy` when consecutive failures >= 3 or the 24h error rate > 20%
//! 3. `degraded` when the last sync succeeded with a 24h error rate in
//!    (5%, 20%], or the integration is overdue for its cadence
//! 4. `healthy`

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{HealthConfig, MAX_PERIOD_SECONDS};
use crate::error::IntegrationError;
use crate::models::integration::Model as IntegrationModel;
use crate::models::{HealthStatus, IntegrationStatus, SyncStatus, health_record, sync_log};
use crate::repositories::{HealthRepository, IntegrationRepository, SyncLogRepository, WindowCounts, db_time};

pub const UNHEALTHY_CONSECUTIVE_FAILURES: u64 = 3;
pub const UNHEALTHY_ERROR_RATE: f64 = 0.20;
pub const DEGRADED_ERROR_RATE: f64 = 0.05;

/// Minimum gap between the 24h and 7d error rates before a trend is reported.
const TREND_TOLERANCE: f64 = 0.05;

/// Direction of the short window relative to the long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
}

impl HealthTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTrend::Improving => "improving",
            HealthTrend::Stable => "stable",
            HealthTrend::Degrading => "degrading",
        }
    }

    /// Compare the 24h error rate with the 7d baseline.
    pub fn from_windows(day: &WindowCounts, week: &WindowCounts) -> Self {
        if day.total() == 0 || week.total() == 0 {
            return HealthTrend::Stable;
        }
        let delta = day.error_rate() - week.error_rate();
        if delta > TREND_TOLERANCE {
            HealthTrend::Degrading
        } else if delta < -TREND_TOLERANCE {
            HealthTrend::Improving
        } else {
            HealthTrend::Stable
        }
    }
}

/// Facts the status rules are evaluated on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
    /// `None` when no sync has finished yet
    pub last_sync_succeeded: Option<bool>,
    pub consecutive_failures: u64,
    pub window_24h: WindowCounts,
    pub overdue: bool,
}

/// Pure status derivation.
pub fn derive_status(inputs: &HealthInputs) -> HealthStatus {
    let Some(last_succeeded) = inputs.last_sync_succeeded else {
        return HealthStatus::Unknown;
    };

    let error_rate = inputs.window_24h.error_rate();
    if inputs.consecutive_failures >= UNHEALTHY_CONSECUTIVE_FAILURES
        || error_rate > UNHEALTHY_ERROR_RATE
    {
        return HealthStatus::Unhealthy;
    }

    if (last_succeeded && error_rate > DEGRADED_ERROR_RATE && error_rate <= UNHEALTHY_ERROR_RATE)
        || inputs.overdue
    {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}

/// Whether an integration with a cadence has missed its expected sync.
///
/// The reference point is the last sync, or creation for integrations that
/// never synced. Inactive integrations are never overdue.
pub fn is_overdue(integration: &IntegrationModel, now: DateTime<Utc>, grace: Duration) -> bool {
    let Some(interval) = integration.sync_interval_seconds.filter(|s| *s > 0) else {
        return false;
    };
    if integration.status().ok() == Some(IntegrationStatus::Inactive) {
        return false;
    }
    let reference = integration
        .last_sync_at_utc()
        .unwrap_or_else(|| integration.created_at_utc());
    Duration::try_seconds(interval)
        .and_then(|interval| reference.checked_add_signed(interval))
        .and_then(|due| due.checked_add_signed(grace))
        .is_some_and(|deadline| deadline < now)
}

/// Configured grace, capped at [`MAX_PERIOD_SECONDS`].
fn overdue_grace(config: &HealthConfig) -> Duration {
    i64::try_from(config.overdue_grace_seconds.min(MAX_PERIOD_SECONDS))
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(Duration::zero)
}

/// Health of one integration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub integration_id: Uuid,
    pub org_id: Uuid,
    pub provider: String,
    pub name: String,
    pub status: HealthStatus,
    pub trend: HealthTrend,
    pub overdue: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub success_count_24h: u64,
    pub failure_count_24h: u64,
    pub success_count_7d: u64,
    pub failure_count_7d: u64,
    pub error_rate_24h: f64,
    pub avg_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// Number of integrations in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl StatusCounts {
    fn add(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
            HealthStatus::Unknown => self.unknown += 1,
        }
    }
}

/// Organization-wide roll-up. The overall status is the worst member's.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrgHealth {
    pub org_id: Uuid,
    pub status: HealthStatus,
    pub total: usize,
    pub counts: StatusCounts,
    pub integrations: Vec<HealthSnapshot>,
}

impl OrgHealth {
    pub fn from_snapshots(org_id: Uuid, integrations: Vec<HealthSnapshot>) -> Self {
        let mut counts = StatusCounts::default();
        for snapshot in &integrations {
            counts.add(snapshot.status);
        }
        let status = integrations
            .iter()
            .map(|s| s.status)
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Unknown);

        Self {
            org_id,
            status,
            total: integrations.len(),
            counts,
            integrations,
        }
    }
}

/// Recomputes and serves per-integration health.
#[derive(Clone)]
pub struct HealthAggregator {
    integrations: IntegrationRepository,
    logs: SyncLogRepository,
    records: HealthRepository,
    config: HealthConfig,
    clock: SharedClock,
}

impl HealthAggregator {
    pub fn new(db: Arc<DatabaseConnection>, config: HealthConfig, clock: SharedClock) -> Self {
        Self {
            integrations: IntegrationRepository::new(db.clone()),
            logs: SyncLogRepository::new(db.clone()),
            records: HealthRepository::new(db),
            config,
            clock,
        }
    }

    /// Recompute from sync logs and persist the health record.
    #[instrument(skip_all, fields(integration_id = %integration.id))]
    pub async fn recompute(&self, integration: &IntegrationModel) -> Result<HealthSnapshot, DbErr> {
        let now = self.clock.now();
        let id = integration.id;

        let latest = self.logs.latest(id).await?;
        let last_success = self.logs.latest_with_status(id, SyncStatus::Completed).await?;
        let last_failure = self.logs.latest_with_status(id, SyncStatus::Failed).await?;
        let consecutive_failures = self.logs.consecutive_failures(id).await?;
        let window_24h = self.logs.window_counts(id, now - Duration::hours(24)).await?;
        let window_7d = self.logs.window_counts(id, now - Duration::days(7)).await?;
        let avg_duration_ms = self
            .logs
            .average_duration_ms(id, self.config.duration_window)
            .await?;

        let grace = overdue_grace(&self.config);
        let overdue = is_overdue(integration, now, grace);
        let inputs = HealthInputs {
            last_sync_succeeded: latest
                .as_ref()
                .map(|log| log.status == SyncStatus::Completed.as_str()),
            consecutive_failures,
            window_24h,
            overdue,
        };
        let status = derive_status(&inputs);
        let trend = HealthTrend::from_windows(&window_24h, &window_7d);

        let snapshot = HealthSnapshot {
            integration_id: id,
            org_id: integration.org_id,
            provider: integration.provider_type.clone(),
            name: integration.name.clone(),
            status,
            trend,
            overdue,
            last_success_at: last_success.as_ref().map(finished_at),
            consecutive_failures,
            success_count_24h: window_24h.successes,
            failure_count_24h: window_24h.failures,
            success_count_7d: window_7d.successes,
            failure_count_7d: window_7d.failures,
            error_rate_24h: window_24h.error_rate(),
            avg_duration_ms,
            last_error: last_failure
                .as_ref()
                .map(|log| log.error_message().unwrap_or("sync failed").to_string()),
            last_error_at: last_failure.as_ref().map(finished_at),
            computed_at: now,
        };

        let previous = self.records.find_for_org(integration.org_id, id).await?;
        self.records.upsert(to_record(&snapshot)).await?;

        match previous {
            Some(previous) if previous.status != status.as_str() => info!(
                from = %previous.status,
                to = %status,
                consecutive_failures,
                "Integration health changed"
            ),
            _ => debug!(status = %status, trend = trend.as_str(), "Health recomputed"),
        }

        Ok(snapshot)
    }

    /// Current health of one integration within an organization.
    pub async fn integration_health(
        &self,
        org_id: Uuid,
        integration_id: Uuid,
    ) -> Result<HealthSnapshot, IntegrationError> {
        let integration = self
            .integrations
            .find_for_org(org_id, integration_id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(integration_id))?;
        Ok(self.recompute(&integration).await?)
    }

    /// Health of every integration in an organization, rolled up.
    #[instrument(skip(self))]
    pub async fn org_health(&self, org_id: Uuid) -> Result<OrgHealth, IntegrationError> {
        let integrations = self.integrations.list_by_org(org_id).await?;
        let mut snapshots = Vec::with_capacity(integrations.len());
        for integration in &integrations {
            snapshots.push(self.recompute(integration).await?);
        }
        Ok(OrgHealth::from_snapshots(org_id, snapshots))
    }

    /// Newest failed sync logs across the organization.
    pub async fn recent_failures(
        &self,
        org_id: Uuid,
        limit: u64,
    ) -> Result<Vec<sync_log::Model>, IntegrationError> {
        Ok(self.logs.recent_failures(org_id, limit).await?)
    }

    /// Newest sync logs of one integration.
    pub async fn sync_logs(
        &self,
        org_id: Uuid,
        integration_id: Uuid,
        limit: u64,
    ) -> Result<Vec<sync_log::Model>, IntegrationError> {
        if self
            .integrations
            .find_for_org(org_id, integration_id)
            .await?
            .is_none()
        {
            return Err(IntegrationError::IntegrationNotFound(integration_id));
        }
        Ok(self
            .logs
            .list_for_integration(org_id, integration_id, limit)
            .await?)
    }

    /// Drop the derived record of a deleted integration.
    pub async fn remove(&self, integration_id: Uuid) -> Result<(), DbErr> {
        self.records.delete(integration_id).await
    }
}

fn finished_at(log: &sync_log::Model) -> DateTime<Utc> {
    log.finished_at.with_timezone(&Utc)
}

fn count(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_record(snapshot: &HealthSnapshot) -> health_record::Model {
    health_record::Model {
        integration_id: snapshot.integration_id,
        org_id: snapshot.org_id,
        status: snapshot.status.as_str().to_string(),
        trend: snapshot.trend.as_str().to_string(),
        last_success_at: snapshot.last_success_at.map(db_time),
        consecutive_failures: count(snapshot.consecutive_failures),
        success_count_24h: count(snapshot.success_count_24h),
        failure_count_24h: count(snapshot.failure_count_24h),
        success_count_7d: count(snapshot.success_count_7d),
        failure_count_7d: count(snapshot.failure_count_7d),
        avg_duration_ms: snapshot.avg_duration_ms,
        last_error: snapshot.last_error.clone(),
        last_error_at: snapshot.last_error_at.map(db_time),
        computed_at: db_time(snapshot.computed_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(successes: u64, failures: u64) -> WindowCounts {
        WindowCounts {
            successes,
            failures,
        }
    }

    fn inputs(last: Option<bool>, consecutive: u64, day: WindowCounts) -> HealthInputs {
        HealthInputs {
            last_sync_succeeded: last,
            consecutive_failures: consecutive,
            window_24h: day,
            overdue: false,
        }
    }

    fn integration(interval: Option<i64>, last_sync: Option<DateTime<Utc>>, created: DateTime<Utc>) -> IntegrationModel {
        IntegrationModel {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            provider_type: "github".into(),
            name: "GitHub".into(),
            config_ciphertext: Vec::new(),
            status: "active".into(),
            sync_interval_seconds: interval,
            retry_policy: None,
            token_expires_at: None,
            lock_expires_at: None,
            last_sync_at: last_sync.map(db_time),
            last_error: None,
            created_at: db_time(created),
            updated_at: db_time(created),
        }
    }

    #[test]
    fn no_logs_is_unknown() {
        assert_eq!(derive_status(&inputs(None, 0, counts(0, 0))), HealthStatus::Unknown);
    }

    #[test]
    fn consecutive_failures_win_over_low_error_rate() {
        // 57 successes, 3 failures: 5% error rate but three in a row
        let status = derive_status(&inputs(Some(false), 3, counts(57, 3)));
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn error_rate_thresholds() {
        assert_eq!(
            derive_status(&inputs(Some(true), 0, counts(7, 3))),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            derive_status(&inputs(Some(true), 0, counts(8, 2))),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(&inputs(Some(true), 0, counts(9, 1))),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(&inputs(Some(true), 0, counts(19, 1))),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn moderate_error_rate_after_failed_sync_is_not_degraded() {
        let status = derive_status(&inputs(Some(false), 1, counts(9, 1)));
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn overdue_degrades_healthy_integration() {
        let mut facts = inputs(Some(true), 0, counts(10, 0));
        facts.overdue = true;
        assert_eq!(derive_status(&facts), HealthStatus::Degraded);
    }

    #[test]
    fn overdue_uses_cadence_and_grace() {
        let now = Utc::now();
        let grace = Duration::minutes(5);

        let fresh = integration(Some(3600), Some(now - Duration::minutes(30)), now - Duration::days(1));
        assert!(!is_overdue(&fresh, now, grace));

        let within_grace = integration(Some(3600), Some(now - Duration::minutes(63)), now - Duration::days(1));
        assert!(!is_overdue(&within_grace, now, grace));

        let late = integration(Some(3600), Some(now - Duration::minutes(70)), now - Duration::days(1));
        assert!(is_overdue(&late, now, grace));

        let never_synced = integration(Some(3600), None, now - Duration::hours(2));
        assert!(is_overdue(&never_synced, now, grace));

        let on_demand = integration(None, None, now - Duration::days(30));
        assert!(!is_overdue(&on_demand, now, grace));

        let mut paused = late.clone();
        paused.status = "inactive".into();
        assert!(!is_overdue(&paused, now, grace));
    }

    #[test]
    fn huge_cadence_or_grace_is_never_overdue() {
        let now = Utc::now();
        let ancient = integration(Some(i64::MAX), None, now - Duration::days(365));
        assert!(!is_overdue(&ancient, now, Duration::zero()));

        let config = HealthConfig {
            overdue_grace_seconds: u64::MAX,
            ..HealthConfig::default()
        };
        assert_eq!(overdue_grace(&config), Duration::seconds(MAX_PERIOD_SECONDS as i64));
    }

    #[test]
    fn trend_compares_day_to_week() {
        assert_eq!(
            HealthTrend::from_windows(&counts(5, 5), &counts(90, 10)),
            HealthTrend::Degrading
        );
        assert_eq!(
            HealthTrend::from_windows(&counts(10, 0), &counts(70, 30)),
            HealthTrend::Improving
        );
        assert_eq!(
            HealthTrend::from_windows(&counts(9, 1), &counts(90, 10)),
            HealthTrend::Stable
        );
        assert_eq!(
            HealthTrend::from_windows(&counts(0, 0), &counts(1, 9)),
            HealthTrend::Stable
        );
    }

    #[test]
    fn org_status_is_worst_member() {
        let now = Utc::now();
        let snapshot = |status| HealthSnapshot {
            integration_id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            provider: "github".into(),
            name: "x".into(),
            status,
            trend: HealthTrend::Stable,
            overdue: false,
            last_success_at: None,
            consecutive_failures: 0,
            success_count_24h: 0,
            failure_count_24h: 0,
            success_count_7d: 0,
            failure_count_7d: 0,
            error_rate_24h: 0.0,
            avg_duration_ms: None,
            last_error: None,
            last_error_at: None,
            computed_at: now,
        };

        let org = OrgHealth::from_snapshots(
            Uuid::nil(),
            vec![
                snapshot(HealthStatus::Healthy),
                snapshot(HealthStatus::Degraded),
                snapshot(HealthStatus::Healthy),
            ],
        );
        assert_eq!(org.status, HealthStatus::Degraded);
        assert_eq!(org.counts.healthy, 2);
        assert_eq!(org.total, 3);

        let empty = OrgHealth::from_snapshots(Uuid::nil(), Vec::new());
        assert_eq!(empty.status, HealthStatus::Unknown);
    }
}
