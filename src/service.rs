//! Integration management.
//!
//! Manual (API key or access key) setup, listing, activation and deletion.
//! OAuth integrations are created by [`crate::oauth::OAuthConnector::complete`]
//! instead.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::crypto::CredentialVault;
use crate::error::IntegrationError;
use crate::locks::CancellationRegistry;
use crate::models::integration::{Model as IntegrationModel, credential_aad};
use crate::models::{Credentials, IntegrationConfig, IntegrationStatus, ProviderType};
use crate::repositories::{IntegrationRepository, NewIntegration};
use crate::retry::RetryPolicy;
use crate::sync::SyncOrchestrator;

/// Input for an integration configured without OAuth.
#[derive(Debug, Clone)]
pub struct ManualIntegration {
    pub org_id: Uuid,
    pub provider: ProviderType,
    pub name: String,
    pub credentials: Credentials,
    pub options: Map<String, Value>,
    pub sync_interval_seconds: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone)]
pub struct IntegrationService {
    integrations: IntegrationRepository,
    vault: Arc<CredentialVault>,
    orchestrator: SyncOrchestrator,
    cancellations: CancellationRegistry,
    clock: SharedClock,
}

impl IntegrationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        vault: Arc<CredentialVault>,
        orchestrator: SyncOrchestrator,
        cancellations: CancellationRegistry,
        clock: SharedClock,
    ) -> Self {
        Self {
            integrations: IntegrationRepository::new(db),
            vault,
            orchestrator,
            cancellations,
            clock,
        }
    }

    /// Create an integration from credentials entered directly.
    #[instrument(skip_all, fields(org_id = %input.org_id, provider = %input.provider))]
    pub async fn create_manual(
        &self,
        input: ManualIntegration,
    ) -> Result<IntegrationModel, IntegrationError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(IntegrationError::InvalidConfig(
                "integration name must not be empty".into(),
            ));
        }
        if matches!(input.credentials, Credentials::OAuth { .. }) {
            return Err(IntegrationError::InvalidConfig(
                "OAuth integrations are created through the authorization flow".into(),
            ));
        }
        if input.sync_interval_seconds.is_some_and(|s| s <= 0) {
            return Err(IntegrationError::InvalidConfig(
                "sync interval must be positive".into(),
            ));
        }

        let id = Uuid::new_v4();
        let config = IntegrationConfig::new(input.credentials).with_options(input.options);
        let sealed = self
            .vault
            .seal_config(
                &credential_aad(input.org_id, input.provider.as_str(), id),
                &config,
            )
            .map_err(|e| IntegrationError::Internal(e.to_string()))?;
        let retry_policy = input
            .retry_policy
            .map(|policy| serde_json::to_value(policy))
            .transpose()?;

        let created = self
            .integrations
            .create(
                NewIntegration {
                    id,
                    org_id: input.org_id,
                    provider: input.provider,
                    name: name.to_string(),
                    config_ciphertext: sealed,
                    sync_interval_seconds: input.sync_interval_seconds,
                    retry_policy,
                    token_expires_at: None,
                },
                self.clock.now(),
            )
            .await?;

        info!(integration_id = %created.id, "Created manual integration");
        Ok(created)
    }

    pub async fn get(&self, org_id: Uuid, id: Uuid) -> Result<IntegrationModel, IntegrationError> {
        self.integrations
            .find_for_org(org_id, id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(id))
    }

    pub async fn list(&self, org_id: Uuid) -> Result<Vec<IntegrationModel>, IntegrationError> {
        Ok(self.integrations.list_by_org(org_id).await?)
    }

    /// Activate or deactivate an integration.
    ///
    /// An integration in `error` status can only be reactivated through the
    /// OAuth flow, and one that is mid-sync cannot be changed at all.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        org_id: Uuid,
        id: Uuid,
        status: IntegrationStatus,
    ) -> Result<IntegrationModel, IntegrationError> {
        if !matches!(status, IntegrationStatus::Active | IntegrationStatus::Inactive) {
            return Err(IntegrationError::InvalidConfig(format!(
                "status {status} cannot be set directly"
            )));
        }

        let current = self.get(org_id, id).await?;
        if status == IntegrationStatus::Active
            && current.status().ok() == Some(IntegrationStatus::Error)
        {
            return Err(IntegrationError::ReauthorizationRequired { integration_id: id });
        }

        if !self
            .integrations
            .set_status(org_id, id, status, self.clock.now())
            .await?
        {
            return Err(IntegrationError::SyncAlreadyInProgress { integration_id: id });
        }

        let updated = self.get(org_id, id).await?;
        if let Err(err) = self.orchestrator.health().recompute(&updated).await {
            warn!(error = %err, "Failed to recompute health after status change");
        }
        info!(status = %status, "Integration status updated");
        Ok(updated)
    }

    /// Delete an integration, cancelling any running sync. Breaker and health
    /// state go with it; sync logs are kept for auditing.
    #[instrument(skip(self))]
    pub async fn delete(&self, org_id: Uuid, id: Uuid) -> Result<(), IntegrationError> {
        self.get(org_id, id).await?;

        if self.cancellations.cancel(id) {
            info!("Cancelled in-flight sync for deleted integration");
        }
        if !self.integrations.delete(org_id, id).await? {
            return Err(IntegrationError::IntegrationNotFound(id));
        }
        self.orchestrator.breaker().remove(id).await?;
        self.orchestrator.health().remove(id).await?;

        info!("Deleted integration");
        Ok(())
    }
}
