//! # OAuth Connector
//!
//! Drives the authorization-code grant for every OAuth provider behind one
//! interface: [`OAuthConnector::begin`], [`OAuthConnector::complete`] and
//! [`OAuthConnector::refresh`].
//!
//! Sessions are single use. `complete` consumes the session before talking
//! to the provider, so a failed exchange also destroys it and the user has to
//! start over. Refresh fails closed: a rejected refresh token moves the
//! integration to `error` and syncs stay blocked until re-authorization.

pub mod catalog;
pub mod client;
pub mod pkce;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::crypto::CredentialVault;
use crate::error::IntegrationError;
use crate::models::integration::{Model as IntegrationModel, credential_aad};
use crate::models::{Credentials, IntegrationConfig, IntegrationStatus, ProviderType};
use crate::repositories::{
    IntegrationRepository, NewIntegration, NewOAuthSession, OAuthSessionRepository,
};

pub use catalog::{ResolvedProvider, oauth_providers};
pub use client::{TokenClient, TokenEndpointError, TokenGrant, TokenResponse};

/// Input to [`OAuthConnector::begin`].
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub org_id: Uuid,
    pub provider: ProviderType,
    /// Requested scopes; empty means the provider's defaults
    pub scopes: Vec<String>,
    pub integration_name: String,
    /// Existing integration to re-authorize instead of creating a new one
    pub integration_id: Option<Uuid>,
}

/// Where to send the user, and the session that awaits the callback.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStart {
    pub authorization_url: Url,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

type RefreshSlots = Arc<StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

/// OAuth authorization and token refresh for all providers.
#[derive(Clone)]
pub struct OAuthConnector {
    config: Arc<AppConfig>,
    sessions: OAuthSessionRepository,
    integrations: IntegrationRepository,
    vault: Arc<CredentialVault>,
    client: TokenClient,
    clock: SharedClock,
    /// Single-flight: one refresh exchange per integration at a time
    in_flight_refreshes: RefreshSlots,
}

impl OAuthConnector {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        vault: Arc<CredentialVault>,
        client: TokenClient,
        clock: SharedClock,
    ) -> Self {
        Self {
            sessions: OAuthSessionRepository::new(db.clone()),
            integrations: IntegrationRepository::new(db),
            config,
            vault,
            client,
            clock,
            in_flight_refreshes: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn resolve(&self, provider: ProviderType) -> Result<ResolvedProvider, IntegrationError> {
        catalog::resolve(provider, self.config.oauth_client(provider))
            .ok_or(IntegrationError::ProviderNotConfigured { provider })
    }

    /// Open an authorization session and build the provider's authorize URL.
    #[instrument(skip_all, fields(org_id = %request.org_id, provider = %request.provider))]
    pub async fn begin(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationStart, IntegrationError> {
        let resolved = self.resolve(request.provider)?;

        let integration_name = request.integration_name.trim().to_string();
        if integration_name.is_empty() {
            return Err(IntegrationError::InvalidConfig(
                "integration name must not be empty".to_string(),
            ));
        }

        if let Some(existing_id) = request.integration_id {
            let existing = self
                .integrations
                .find_for_org(request.org_id, existing_id)
                .await?
                .ok_or(IntegrationError::IntegrationNotFound(existing_id))?;
            if existing.provider_type != request.provider.as_str() {
                return Err(IntegrationError::InvalidConfig(format!(
                    "integration {} belongs to provider {}",
                    existing_id, existing.provider_type
                )));
            }
        }

        let scopes = if request.scopes.is_empty() {
            resolved.default_scopes.clone()
        } else {
            request.scopes
        };

        let state = pkce::generate_state();
        let code_verifier = resolved.uses_pkce.then(pkce::generate_code_verifier);
        let challenge = code_verifier.as_deref().map(pkce::code_challenge);

        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(self.config.oauth_session_ttl())
                .unwrap_or_else(|_| chrono::Duration::minutes(10));

        self.sessions
            .create(
                NewOAuthSession {
                    org_id: request.org_id,
                    provider: request.provider,
                    state: state.clone(),
                    scopes: scopes.clone(),
                    code_verifier,
                    integration_name,
                    integration_id: request.integration_id,
                    expires_at,
                },
                now,
            )
            .await?;

        let authorization_url = resolved.authorization_url(
            &self.config.oauth_redirect_uri,
            &state,
            &scopes,
            challenge.as_deref(),
        );

        info!(
            reauthorize = request.integration_id.is_some(),
            "Started OAuth authorization"
        );

        Ok(AuthorizationStart {
            authorization_url,
            state,
            expires_at,
        })
    }

    /// Finish the flow: consume the session, exchange the code and store the
    /// sealed tokens on a new or re-authorized integration.
    #[instrument(skip_all)]
    pub async fn complete(
        &self,
        state: &str,
        code: &str,
    ) -> Result<IntegrationModel, IntegrationError> {
        let now = self.clock.now();
        let Some(session) = self.sessions.consume(state, now).await? else {
            counter!("oauth_exchange_total", "provider" => "unknown", "outcome" => "invalid_state")
                .increment(1);
            return Err(IntegrationError::InvalidOrExpiredState);
        };

        let provider: ProviderType = session
            .provider_type
            .parse()
            .map_err(|e| IntegrationError::Internal(format!("stored session: {e}")))?;
        let resolved = self.resolve(provider)?;

        let token = self
            .client
            .request_token(
                &resolved,
                TokenGrant::AuthorizationCode {
                    code,
                    redirect_uri: &self.config.oauth_redirect_uri,
                    code_verifier: session.code_verifier.as_deref(),
                },
            )
            .await
            .map_err(|err| {
                warn!(provider = %provider, error = %err, "OAuth code exchange failed");
                counter!("oauth_exchange_total", "provider" => provider.as_str(), "outcome" => "failed")
                    .increment(1);
                IntegrationError::OAuthExchangeFailed {
                    message: err.to_string(),
                    status: err.status(),
                }
            })?;

        let now = self.clock.now();
        let token_expires_at = token.expires_at(now);
        let credentials = Credentials::OAuth {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token_expires_at,
            scopes: token
                .granted_scopes()
                .unwrap_or_else(|| session.scope_list()),
        };

        let integration = match session.integration_id {
            Some(existing_id) => {
                self.store_reauthorization(existing_id, session.org_id, credentials, token_expires_at, now)
                    .await?
            }
            None => {
                let id = Uuid::new_v4();
                let aad = credential_aad(session.org_id, provider.as_str(), id);
                let sealed = self
                    .vault
                    .seal_config(&aad, &IntegrationConfig::new(credentials))
                    .map_err(|e| IntegrationError::Internal(e.to_string()))?;

                self.integrations
                    .create(
                        NewIntegration {
                            id,
                            org_id: session.org_id,
                            provider,
                            name: session.integration_name.clone(),
                            config_ciphertext: sealed,
                            sync_interval_seconds: None,
                            retry_policy: None,
                            token_expires_at,
                        },
                        now,
                    )
                    .await?
            }
        };

        counter!("oauth_exchange_total", "provider" => provider.as_str(), "outcome" => "success")
            .increment(1);
        info!(
            integration_id = %integration.id,
            org_id = %integration.org_id,
            provider = %provider,
            "OAuth authorization completed"
        );
        Ok(integration)
    }

    async fn store_reauthorization(
        &self,
        integration_id: Uuid,
        org_id: Uuid,
        credentials: Credentials,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IntegrationModel, IntegrationError> {
        let existing = self
            .integrations
            .find_for_org(org_id, integration_id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(integration_id))?;

        // Provider options survive re-authorization when the old blob is readable.
        let options = self
            .vault
            .open_config(&existing)
            .map(|config| config.options)
            .unwrap_or_default();
        let sealed = self
            .vault
            .seal_config(
                &existing.credential_aad(),
                &IntegrationConfig::new(credentials).with_options(options),
            )
            .map_err(|e| IntegrationError::Internal(e.to_string()))?;

        self.integrations
            .reauthorize(integration_id, sealed, token_expires_at, now)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(integration_id))
    }

    /// Drop a session whose callback carried an error instead of a code.
    pub async fn abandon(&self, state: &str) -> Result<bool, IntegrationError> {
        Ok(self.sessions.delete_by_state(state).await?)
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Concurrent calls for one integration share a single exchange: callers
    /// that waited on an in-flight refresh get the row it produced.
    #[instrument(skip_all, fields(integration_id = %integration.id))]
    pub async fn refresh(
        &self,
        integration: &IntegrationModel,
    ) -> Result<IntegrationModel, IntegrationError> {
        let slot = self.refresh_slot(integration.id);
        let result = {
            let _exclusive = slot.lock().await;
            self.refresh_exclusive(integration).await
        };
        self.release_refresh_slot(integration.id, slot);
        result
    }

    fn refresh_slot(&self, integration_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut slots = self
            .in_flight_refreshes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(integration_id).or_default().clone()
    }

    fn release_refresh_slot(&self, integration_id: Uuid, slot: Arc<AsyncMutex<()>>) {
        let mut slots = self
            .in_flight_refreshes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&slot) <= 2 {
            slots.remove(&integration_id);
        }
    }

    async fn refresh_exclusive(
        &self,
        observed: &IntegrationModel,
    ) -> Result<IntegrationModel, IntegrationError> {
        let current = self
            .integrations
            .find_by_id(observed.id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(observed.id))?;

        // Every seal uses a fresh nonce, so any write changes the blob.
        if current.config_ciphertext != observed.config_ciphertext {
            debug!("Credentials changed while waiting; reusing concurrent refresh");
            return Ok(current);
        }
        if current.status().ok() == Some(IntegrationStatus::Error) {
            return Err(IntegrationError::ReauthorizationRequired {
                integration_id: current.id,
            });
        }

        let provider = current
            .provider()
            .map_err(|e| IntegrationError::Internal(e.to_string()))?;
        let resolved = self.resolve(provider)?;

        let config = match self.vault.open_config(&current) {
            Ok(config) => config,
            Err(source) => {
                self.integrations
                    .mark_error(
                        current.id,
                        "stored credentials cannot be decrypted; re-authorize the integration",
                        self.clock.now(),
                    )
                    .await?;
                return Err(IntegrationError::CorruptCredential {
                    integration_id: current.id,
                    source,
                });
            }
        };

        let Some(refresh_token) = config.refresh_token() else {
            self.fail_closed(&current, provider, "access token expired and no refresh token is stored")
                .await?;
            return Err(IntegrationError::ReauthorizationRequired {
                integration_id: current.id,
            });
        };

        counter!("token_refresh_attempts_total", "provider" => provider.as_str()).increment(1);
        let token = match self
            .client
            .request_token(&resolved, TokenGrant::RefreshToken { refresh_token })
            .await
        {
            Ok(token) => token,
            Err(err) if err.is_rejected_grant() => {
                counter!("token_refresh_rejected_total", "provider" => provider.as_str()).increment(1);
                self.fail_closed(&current, provider, &format!("refresh token rejected: {err}"))
                    .await?;
                return Err(IntegrationError::ReauthorizationRequired {
                    integration_id: current.id,
                });
            }
            Err(err) => {
                counter!("token_refresh_failure_total", "provider" => provider.as_str()).increment(1);
                warn!(provider = %provider, error = %err, "Token refresh failed");
                return Err(IntegrationError::OAuthExchangeFailed {
                    message: err.to_string(),
                    status: err.status(),
                });
            }
        };

        let now = self.clock.now();
        let expires_at = token.expires_at(now);
        let (previous_refresh, previous_scopes) = match &config.credentials {
            Credentials::OAuth {
                refresh_token,
                scopes,
                ..
            } => (refresh_token.clone(), scopes.clone()),
            _ => (None, Vec::new()),
        };
        let refreshed = IntegrationConfig::new(Credentials::OAuth {
            access_token: token.access_token.clone(),
            // Providers that do not rotate refresh tokens omit them
            refresh_token: token.refresh_token.clone().or(previous_refresh),
            expires_at,
            scopes: token.granted_scopes().unwrap_or(previous_scopes),
        })
        .with_options(config.options.clone());

        let sealed = self
            .vault
            .seal_config(&current.credential_aad(), &refreshed)
            .map_err(|e| IntegrationError::Internal(e.to_string()))?;
        self.integrations
            .update_config(current.id, sealed, expires_at, now)
            .await?;

        counter!("token_refresh_success_total", "provider" => provider.as_str()).increment(1);
        info!(provider = %provider, expires_at = ?expires_at, "Refreshed OAuth token");

        self.integrations
            .find_by_id(current.id)
            .await?
            .ok_or(IntegrationError::IntegrationNotFound(current.id))
    }

    async fn fail_closed(
        &self,
        integration: &IntegrationModel,
        provider: ProviderType,
        reason: &str,
    ) -> Result<(), IntegrationError> {
        warn!(
            integration_id = %integration.id,
            provider = %provider,
            reason,
            "Marking integration as requiring re-authorization"
        );
        self.integrations
            .mark_error(integration.id, reason, self.clock.now())
            .await?;
        Ok(())
    }
}
