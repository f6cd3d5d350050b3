//! # Token Refresh Service
//!
//! Background task that periodically scans active OAuth integrations and
//! refreshes access tokens nearing expiry, so scheduled syncs rarely need the
//! reactive refresh path. Each tick also purges OAuth sessions whose callback
//! never arrived.
//!
//! Integrations with a sync in flight are skipped: the sync refreshes for
//! itself. A refresh takes the same two locks as a sync, the in-process
//! guard and then the database lease, so it never races a sync running on
//! another instance.

use std::sync::Arc;

use chrono::Duration;
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::DatabaseConnection;
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::SharedClock;
use crate::config::{MAX_PERIOD_SECONDS, TokenRefreshConfig};
use crate::crypto::CredentialVault;
use crate::error::IntegrationError;
use crate::locks::IntegrationLocks;
use crate::models::integration::Model as IntegrationModel;
use crate::oauth::OAuthConnector;
use crate::repositories::{IntegrationRepository, OAuthSessionRepository};

/// Counters for one refresh tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub polled: u64,
    pub refreshed: u64,
    pub failed: u64,
    pub marked_error: u64,
    pub skipped: u64,
    pub sessions_purged: u64,
}

/// How one integration's proactive refresh ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed,
    MarkedError,
    Skipped,
}

/// Background token refresh service
#[derive(Clone)]
pub struct TokenRefreshService {
    config: TokenRefreshConfig,
    integrations: IntegrationRepository,
    sessions: OAuthSessionRepository,
    vault: Arc<CredentialVault>,
    oauth: OAuthConnector,
    locks: IntegrationLocks,
    lock_lease: Duration,
    clock: SharedClock,
}

impl TokenRefreshService {
    pub fn new(
        config: TokenRefreshConfig,
        db: Arc<DatabaseConnection>,
        vault: Arc<CredentialVault>,
        oauth: OAuthConnector,
        locks: IntegrationLocks,
        lock_lease: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        let lock_lease = Duration::from_std(lock_lease)
            .unwrap_or_else(|_| Duration::seconds(MAX_PERIOD_SECONDS as i64));
        Self {
            config,
            integrations: IntegrationRepository::new(db.clone()),
            sessions: OAuthSessionRepository::new(db),
            vault,
            oauth,
            locks,
            lock_lease,
            clock,
        }
    }

    /// Run the token refresh loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting token refresh service");
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Token refresh tick failed");
                    }
                    histogram!("token_refresh_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// Refresh every token expiring within the lead time, then purge expired
    /// OAuth sessions.
    pub async fn tick(&self) -> Result<RefreshReport, IntegrationError> {
        let now = self.clock.now();
        let cutoff = i64::try_from(self.config.lead_time_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lead_time| now.checked_add_signed(lead_time))
            .ok_or_else(|| {
                IntegrationError::InvalidConfig(format!(
                    "token refresh lead time of {}s is out of range",
                    self.config.lead_time_seconds
                ))
            })?;
        let due = self.integrations.list_expiring_tokens(cutoff).await?;

        let mut report = RefreshReport {
            polled: due.len() as u64,
            ..RefreshReport::default()
        };
        gauge!("token_refresh_integrations_polled_gauge").set(due.len() as f64);
        debug!(
            due = due.len(),
            lead_time_seconds = self.config.lead_time_seconds,
            "Found integrations due for token refresh"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(due.len());
        for integration in due {
            let semaphore = semaphore.clone();
            let service = self.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return RefreshOutcome::Failed;
                };
                service.refresh_with_jitter(integration).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                Ok(RefreshOutcome::Failed) => report.failed += 1,
                Ok(RefreshOutcome::MarkedError) => report.marked_error += 1,
                Ok(RefreshOutcome::Skipped) => report.skipped += 1,
                Err(join_error) => {
                    error!(error = ?join_error, "Refresh task panicked or was cancelled");
                    report.failed += 1;
                }
            }
        }

        match self.sessions.cleanup_expired(self.clock.now()).await {
            Ok(purged) => {
                report.sessions_purged = purged;
                if purged > 0 {
                    counter!("oauth_sessions_expired_total").increment(purged);
                }
            }
            Err(err) => warn!(error = %err, "Failed to purge expired OAuth sessions"),
        }

        debug!(
            polled = report.polled,
            refreshed = report.refreshed,
            failed = report.failed,
            marked_error = report.marked_error,
            skipped = report.skipped,
            sessions_purged = report.sessions_purged,
            "Token refresh tick completed"
        );
        Ok(report)
    }

    async fn refresh_with_jitter(&self, integration: IntegrationModel) -> RefreshOutcome {
        let jitter_seconds = compute_jitter(&self.config, &mut rand::thread_rng());
        if jitter_seconds > 0 {
            debug!(
                integration_id = %integration.id,
                jitter_seconds,
                "Applying jitter before token refresh"
            );
            self.clock
                .sleep(std::time::Duration::from_secs(jitter_seconds))
                .await;
        }

        self.refresh_integration(integration).await
    }

    /// Refresh one integration's token now, unless a sync holds it.
    ///
    /// `integration` may be stale; the lease claim and the connector both
    /// re-read the row.
    #[instrument(skip_all, fields(integration_id = %integration.id))]
    pub async fn refresh_integration(&self, integration: IntegrationModel) -> RefreshOutcome {
        let Some(_guard) = self.locks.try_acquire(integration.id) else {
            debug!("Sync in progress; leaving refresh to the running sync");
            return RefreshOutcome::Skipped;
        };

        // Tokens without a refresh grant are left to expire; the next sync
        // reports them.
        match self.vault.open_config(&integration) {
            Ok(config) if config.refresh_token().is_none() => return RefreshOutcome::Skipped,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Stored credentials unreadable; skipping proactive refresh");
                return RefreshOutcome::Skipped;
            }
        }

        let now = self.clock.now();
        let Some(lease_until) = now.checked_add_signed(self.lock_lease) else {
            warn!("Lock lease out of range; skipping proactive refresh");
            return RefreshOutcome::Failed;
        };
        match self
            .integrations
            .try_mark_syncing(integration.id, now, lease_until)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Database lease held elsewhere; leaving refresh to that worker");
                return RefreshOutcome::Skipped;
            }
            Err(err) => {
                warn!(error = %err, "Failed to claim lease for token refresh");
                return RefreshOutcome::Failed;
            }
        }

        let outcome = match self.oauth.refresh(&integration).await {
            Ok(_) => RefreshOutcome::Refreshed,
            Err(err) if err.needs_reauthorization() => {
                counter!("token_refresh_integrations_marked_error_total").increment(1);
                RefreshOutcome::MarkedError
            }
            Err(err) => {
                warn!(error = %err, "Proactive token refresh failed; will retry next tick");
                RefreshOutcome::Failed
            }
        };

        // Only touches rows still `syncing`; an `error` mark stays.
        if let Err(err) = self
            .integrations
            .release_lock(integration.id, self.clock.now())
            .await
        {
            warn!(error = %err, "Failed to release lease after token refresh");
        }
        outcome
    }
}

/// Delay before one refresh, spread over `lead_time * jitter_factor`.
fn compute_jitter<R: Rng + ?Sized>(config: &TokenRefreshConfig, rng: &mut R) -> u64 {
    if config.jitter_factor <= 0.0 {
        return 0;
    }

    let max_delay_seconds = (config.lead_time_seconds as f64 * config.jitter_factor) as u64;
    rng.gen_range(0..=max_delay_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn refresh_config(jitter_factor: f64) -> TokenRefreshConfig {
        TokenRefreshConfig {
            tick_seconds: 300,
            lead_time_seconds: 600,
            concurrency: 4,
            jitter_factor,
        }
    }

    #[test]
    fn jitter_stays_within_lead_time_fraction() {
        let config = refresh_config(0.1);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..100 {
            assert!(compute_jitter(&config, &mut rng) <= 60);
        }
    }

    #[test]
    fn no_jitter_when_factor_is_zero() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        assert_eq!(compute_jitter(&refresh_config(0.0), &mut rng), 0);
        assert_eq!(compute_jitter(&refresh_config(-1.0), &mut rng), 0);
    }
}
