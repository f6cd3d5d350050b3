//! # Sync Orchestrator
//!
//! `run_sync` is the single entry point for pulling data from a provider:
//!
//! 1. take the per-integration lock (in-process, then the database lease);
//!    a held lock fails fast with `SyncAlreadyInProgress`
//! 2. consult the circuit breaker; `open` fails with `CircuitOpen`
//! 3. decrypt the configuration, refreshing the OAuth token first when it is
//!    about to expire
//! 4. run the provider inside the retry executor; an `auth_failure` gets one
//!    token refresh and one more executor run
//! 5. persist the sync log, update the integration, then feed the breaker and
//!    the health aggregator
//!
//! The body runs on its own task so a panicking provider cannot leave the
//! integration locked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::circuit_breaker::{BreakerSettings, CircuitBreaker};
use crate::classifier::{ErrorKind, SyncFailure};
use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::crypto::CredentialVault;
use crate::error::IntegrationError;
use crate::health::HealthAggregator;
use crate::locks::{CancellationRegistry, IntegrationLocks, LockGuard};
use crate::models::integration::Model as IntegrationModel;
use crate::models::{IntegrationConfig, IntegrationStatus, ProviderType, SyncStatus, SyncType};
use crate::oauth::OAuthConnector;
use crate::providers::{ProviderError, ProviderRegistry, SyncProvider, SyncReport};
use crate::repositories::{
    CircuitBreakerRepository, IntegrationRepository, NewSyncLog, SyncLogRepository,
};
use crate::retry::{Attempted, RetryError, RetryExecutor, RetryPolicy};

/// `error_kind` recorded when stored credentials cannot be decrypted.
pub const CORRUPT_CREDENTIAL_KIND: &str = "corrupt_credential";

/// Terminal result of one sync run, after all internal retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub integration_id: Uuid,
    pub sync_log_id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub records_processed: u64,
    /// Provider calls made across every executor run
    pub attempts: u32,
    pub token_refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }
}

/// Everything the orchestrator shares with the rest of the service.
#[derive(Clone)]
pub struct SyncDependencies {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub registry: Arc<ProviderRegistry>,
    pub vault: Arc<CredentialVault>,
    pub oauth: OAuthConnector,
    pub locks: IntegrationLocks,
    pub cancellations: CancellationRegistry,
    pub clock: SharedClock,
}

/// Result of the provider phase, before persistence.
struct ProviderRun {
    report: Option<SyncReport>,
    failure: Option<SyncFailure>,
    attempts: u32,
    token_refreshed: bool,
    /// The integration was moved to `error`; the breaker is not fed.
    reauthorization_required: bool,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    config: Arc<AppConfig>,
    integrations: IntegrationRepository,
    logs: SyncLogRepository,
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    oauth: OAuthConnector,
    breaker: CircuitBreaker,
    health: HealthAggregator,
    locks: IntegrationLocks,
    cancellations: CancellationRegistry,
    clock: SharedClock,
}

impl SyncOrchestrator {
    pub fn new(deps: SyncDependencies) -> Result<Self, IntegrationError> {
        let breaker = CircuitBreaker::new(
            CircuitBreakerRepository::new(deps.db.clone()),
            BreakerSettings::try_from(&deps.config.breaker)?,
            deps.clock.clone(),
        );
        let health = HealthAggregator::new(
            deps.db.clone(),
            deps.config.health.clone(),
            deps.clock.clone(),
        );

        Ok(Self {
            integrations: IntegrationRepository::new(deps.db.clone()),
            logs: SyncLogRepository::new(deps.db),
            config: deps.config,
            registry: deps.registry,
            vault: deps.vault,
            oauth: deps.oauth,
            breaker,
            health,
            locks: deps.locks,
            cancellations: deps.cancellations,
            clock: deps.clock,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    /// Run one sync for `integration_id`.
    ///
    /// Provider failures are reported through the returned [`SyncOutcome`];
    /// `Err` is reserved for framework conditions such as `CircuitOpen`,
    /// `SyncAlreadyInProgress`, `CorruptCredential` or `Cancelled`.
    pub async fn run_sync(
        &self,
        integration_id: Uuid,
        sync_type: SyncType,
    ) -> Result<SyncOutcome, IntegrationError> {
        let span = info_span!("run_sync", integration_id = %integration_id, sync_type = %sync_type);
        self.run_sync_inner(integration_id, sync_type)
            .instrument(span)
            .await
    }

    async fn run_sync_inner(
        &self,
        integration_id: Uuid,
        sync_type: SyncType,
    ) -> Result<SyncOutcome, IntegrationError> {
        let integration = self
            .integrations
            .find_by_id(integration_id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(integration_id))?;

        let guard = self
            .locks
            .try_acquire(integration_id)
            .ok_or(IntegrationError::SyncAlreadyInProgress { integration_id })?;

        match integration.status() {
            Ok(IntegrationStatus::Inactive) => {
                return Err(IntegrationError::IntegrationInactive { integration_id });
            }
            Ok(IntegrationStatus::Error) => {
                return Err(IntegrationError::ReauthorizationRequired { integration_id });
            }
            Ok(_) => {}
            Err(e) => return Err(IntegrationError::Internal(e.to_string())),
        }

        self.breaker.check(integration_id, integration.org_id).await?;

        let started_at = self.clock.now();
        let lease_until = started_at
            .checked_add_signed(to_chrono(Duration::from_secs(self.config.sync.lock_lease_seconds)))
            .ok_or_else(|| {
                IntegrationError::InvalidConfig(format!(
                    "sync lock lease of {}s is out of range",
                    self.config.sync.lock_lease_seconds
                ))
            })?;
        if !self
            .integrations
            .try_mark_syncing(integration_id, started_at, lease_until)
            .await?
        {
            debug!("Database lease held by another worker");
            return Err(IntegrationError::SyncAlreadyInProgress { integration_id });
        }

        let cancel = self.cancellations.register(integration_id);
        let worker = self.clone();
        let task = tokio::spawn(
            async move {
                worker
                    .execute(integration, sync_type, cancel, started_at, guard)
                    .await
            }
            .in_current_span(),
        );

        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(error = %join_error, "Sync task panicked");
                counter!("sync_runs_total", "provider" => "unknown", "status" => "panicked")
                    .increment(1);
                Err(IntegrationError::Internal(format!(
                    "sync task aborted: {join_error}"
                )))
            }
        };

        self.cancellations.remove(integration_id);
        if result.is_err() {
            // Idempotent: only touches rows still marked `syncing`.
            if let Err(err) = self
                .integrations
                .release_lock(integration_id, self.clock.now())
                .await
            {
                warn!(error = %err, "Failed to release sync lease");
            }
        }
        result
    }

    async fn execute(
        &self,
        integration: IntegrationModel,
        sync_type: SyncType,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
        _guard: LockGuard,
    ) -> Result<SyncOutcome, IntegrationError> {
        let provider_type = integration
            .provider()
            .map_err(|e| IntegrationError::Internal(e.to_string()))?;
        let provider = self.registry.get(provider_type)?;

        let config = match self.vault.open_config(&integration) {
            Ok(config) => config,
            Err(source) => {
                return self
                    .record_corrupt_credential(&integration, sync_type, started_at, source)
                    .await;
            }
        };

        let run = self
            .run_provider(integration.clone(), config, provider.as_ref(), sync_type, &cancel)
            .await?;

        if cancel.is_cancelled() {
            info!("Sync cancelled before persistence");
            return Err(IntegrationError::Cancelled {
                integration_id: integration.id,
            });
        }

        self.persist(&integration, provider_type, sync_type, started_at, run)
            .await
    }

    async fn run_provider(
        &self,
        mut integration: IntegrationModel,
        mut config: IntegrationConfig,
        provider: &dyn SyncProvider,
        sync_type: SyncType,
        cancel: &CancellationToken,
    ) -> Result<ProviderRun, IntegrationError> {
        let mut token_refreshed = false;

        let lead_time = to_chrono(Duration::from_secs(self.config.token_refresh.lead_time_seconds));
        if config.refresh_token().is_some()
            && config.token_expires_within(self.clock.now(), lead_time)
        {
            match self.refresh_credentials(&integration).await {
                Ok((updated, refreshed_config)) => {
                    integration = updated;
                    config = refreshed_config;
                    token_refreshed = true;
                }
                Err(err) if err.needs_reauthorization() => {
                    return Ok(ProviderRun::reauthorization(err, 0, false));
                }
                Err(err) => {
                    warn!(error = %err, "Proactive token refresh failed; trying the current token");
                }
            }
        }

        let policy = RetryPolicy::from_config(&self.config.sync)
            .with_override(integration.retry_policy.as_ref());

        let first = self
            .attempt(&policy, provider, &config, sync_type, cancel)
            .await;
        let (failure, attempts) = match first {
            Ok(done) => return Ok(ProviderRun::success(done, token_refreshed)),
            Err(RetryError::Cancelled { .. }) => {
                return Err(IntegrationError::Cancelled {
                    integration_id: integration.id,
                });
            }
            Err(RetryError::Failed(failure)) => {
                let attempts = failure.attempts;
                (failure, attempts)
            }
        };

        if failure.kind != ErrorKind::AuthFailure || !config.is_oauth() || token_refreshed {
            return Ok(ProviderRun::failed(failure, attempts, token_refreshed));
        }

        info!("Provider rejected credentials; refreshing token and retrying once");
        let (_, refreshed_config) = match self.refresh_credentials(&integration).await {
            Ok(refreshed) => refreshed,
            Err(err) if err.needs_reauthorization() => {
                return Ok(ProviderRun::reauthorization(err, attempts, false));
            }
            Err(err) => {
                warn!(error = %err, "Reactive token refresh failed");
                return Ok(ProviderRun::failed(failure, attempts, false));
            }
        };

        match self
            .attempt(&policy, provider, &refreshed_config, sync_type, cancel)
            .await
        {
            Ok(mut done) => {
                done.attempts += attempts;
                Ok(ProviderRun::success(done, true))
            }
            Err(RetryError::Cancelled { .. }) => Err(IntegrationError::Cancelled {
                integration_id: integration.id,
            }),
            Err(RetryError::Failed(retry_failure)) => {
                let total = attempts + retry_failure.attempts;
                Ok(ProviderRun::failed(retry_failure.with_attempts(total), total, true))
            }
        }
    }

    /// One retry-executor run against the provider.
    async fn attempt(
        &self,
        policy: &RetryPolicy,
        provider: &dyn SyncProvider,
        config: &IntegrationConfig,
        sync_type: SyncType,
        cancel: &CancellationToken,
    ) -> Result<Attempted<SyncReport>, RetryError> {
        let timeout = self.config.sync.provider_timeout();
        let executor = RetryExecutor::new(*policy, self.clock.as_ref(), cancel);

        executor
            .execute(|attempt| async move {
                debug!(attempt, "Calling provider");
                match tokio::time::timeout(timeout, provider.execute_sync(config, sync_type)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await
    }

    /// Refresh through the OAuth connector and reopen the new configuration.
    async fn refresh_credentials(
        &self,
        integration: &IntegrationModel,
    ) -> Result<(IntegrationModel, IntegrationConfig), IntegrationError> {
        let updated = self.oauth.refresh(integration).await?;
        let config = self
            .vault
            .open_config(&updated)
            .map_err(|source| IntegrationError::CorruptCredential {
                integration_id: updated.id,
                source,
            })?;
        Ok((updated, config))
    }

    async fn persist(
        &self,
        integration: &IntegrationModel,
        provider_type: ProviderType,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
        run: ProviderRun,
    ) -> Result<SyncOutcome, IntegrationError> {
        let finished_at = self.clock.now();
        let status = if run.failure.is_none() {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        let records_processed = run
            .report
            .as_ref()
            .map(|report| report.records_processed)
            .unwrap_or(0);

        let log = self
            .logs
            .insert(NewSyncLog {
                integration_id: integration.id,
                org_id: integration.org_id,
                sync_type,
                status,
                started_at,
                finished_at,
                records_processed,
                attempts: run.attempts,
                error_kind: run.failure.as_ref().map(|f| f.kind.as_str().to_string()),
                error_detail: run
                    .failure
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            })
            .await?;

        let last_error = run.failure.as_ref().map(SyncFailure::summary);
        self.integrations
            .finish_sync(integration.id, finished_at, last_error)
            .await?;

        if !run.reauthorization_required {
            self.breaker
                .record_outcome(integration.id, integration.org_id, run.failure.is_none())
                .await?;
        }
        self.recompute_health(integration.id).await;

        counter!(
            "sync_runs_total",
            "provider" => provider_type.as_str(),
            "status" => status.as_str()
        )
        .increment(1);
        histogram!("sync_duration_ms", "provider" => provider_type.as_str())
            .record(log.duration_ms as f64);

        match &run.failure {
            None => info!(
                records_processed,
                attempts = run.attempts,
                duration_ms = log.duration_ms,
                "Sync completed"
            ),
            Some(failure) => warn!(
                kind = %failure.kind,
                attempts = run.attempts,
                error = %failure.message,
                "Sync failed"
            ),
        }

        Ok(SyncOutcome {
            integration_id: integration.id,
            sync_log_id: log.id,
            sync_type,
            status,
            records_processed,
            attempts: run.attempts,
            token_refreshed: run.token_refreshed,
            failure: run.failure,
            started_at,
            finished_at,
            duration_ms: log.duration_ms,
        })
    }

    /// Undecryptable credentials: log the failed run, block the integration
    /// and surface `CorruptCredential`. The breaker is not involved.
    async fn record_corrupt_credential(
        &self,
        integration: &IntegrationModel,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
        source: crate::crypto::CryptoError,
    ) -> Result<SyncOutcome, IntegrationError> {
        let now = self.clock.now();
        let message = "stored credentials cannot be decrypted; re-authorize the integration";
        error!(error = %source, "Credential decryption failed");

        self.logs
            .insert(NewSyncLog {
                integration_id: integration.id,
                org_id: integration.org_id,
                sync_type,
                status: SyncStatus::Failed,
                started_at,
                finished_at: now,
                records_processed: 0,
                attempts: 0,
                error_kind: Some(CORRUPT_CREDENTIAL_KIND.to_string()),
                error_detail: Some(serde_json::json!({
                    "kind": CORRUPT_CREDENTIAL_KIND,
                    "message": message,
                    "attempts": 0,
                })),
            })
            .await?;
        self.integrations
            .finish_sync(integration.id, now, Some(message.to_string()))
            .await?;
        self.integrations
            .mark_error(integration.id, message, now)
            .await?;
        self.recompute_health(integration.id).await;

        Err(IntegrationError::CorruptCredential {
            integration_id: integration.id,
            source,
        })
    }

    async fn recompute_health(&self, integration_id: Uuid) {
        let refreshed = match self.integrations.find_by_id(integration_id).await {
            Ok(Some(integration)) => integration,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "Could not reload integration for health recompute");
                return;
            }
        };
        if let Err(err) = self.health.recompute(&refreshed).await {
            warn!(error = %err, "Health recompute failed");
        }
    }
}

impl ProviderRun {
    fn success(done: Attempted<SyncReport>, token_refreshed: bool) -> Self {
        Self {
            report: Some(done.value),
            failure: None,
            attempts: done.attempts,
            token_refreshed,
            reauthorization_required: false,
        }
    }

    fn failed(failure: SyncFailure, attempts: u32, token_refreshed: bool) -> Self {
        Self {
            report: None,
            failure: Some(failure),
            attempts,
            token_refreshed,
            reauthorization_required: false,
        }
    }

    fn reauthorization(err: IntegrationError, attempts: u32, token_refreshed: bool) -> Self {
        Self {
            report: None,
            failure: Some(SyncFailure {
                kind: ErrorKind::AuthFailure,
                message: err.to_string(),
                attempts,
                http_status: None,
                retry_after_seconds: None,
            }),
            attempts,
            token_refreshed,
            reauthorization_required: true,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}
