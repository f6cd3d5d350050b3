//! Component wiring.
//!
//! Builds the shared services from one config, pool and clock, and runs the
//! background loops until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::crypto::CredentialVault;
use crate::locks::{CancellationRegistry, IntegrationLocks};
use crate::oauth::{OAuthConnector, TokenClient};
use crate::providers::ProviderRegistry;
use crate::repositories::IntegrationRepository;
use crate::scheduler::SyncScheduler;
use crate::service::IntegrationService;
use crate::sync::{SyncDependencies, SyncOrchestrator};
use crate::token_refresh::TokenRefreshService;

/// Application state shared by the CLI commands and background loops.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub vault: Arc<CredentialVault>,
    pub locks: IntegrationLocks,
    pub cancellations: CancellationRegistry,
    pub oauth: OAuthConnector,
    pub orchestrator: SyncOrchestrator,
    pub integrations: IntegrationService,
    pub clock: SharedClock,
}

impl AppState {
    /// Wire every component with the default provider registry.
    pub fn build(config: AppConfig, db: DatabaseConnection, clock: SharedClock) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("integrations/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        let registry = ProviderRegistry::with_defaults(&config, http.clone());
        Self::with_registry(config, db, clock, registry, http)
    }

    /// Wire every component around an explicit provider registry.
    pub fn with_registry(
        config: AppConfig,
        db: DatabaseConnection,
        clock: SharedClock,
        registry: ProviderRegistry,
        http: reqwest::Client,
    ) -> Result<Self> {
        let vault = Arc::new(CredentialVault::from_config(&config).context("initializing credential vault")?);
        let config = Arc::new(config);
        let db = Arc::new(db);
        let locks = IntegrationLocks::new();
        let cancellations = CancellationRegistry::new();

        let oauth = OAuthConnector::new(
            config.clone(),
            db.clone(),
            vault.clone(),
            TokenClient::new(http, config.sync.provider_timeout()),
            clock.clone(),
        );
        let orchestrator = SyncOrchestrator::new(SyncDependencies {
            config: config.clone(),
            db: db.clone(),
            registry: Arc::new(registry),
            vault: vault.clone(),
            oauth: oauth.clone(),
            locks: locks.clone(),
            cancellations: cancellations.clone(),
            clock: clock.clone(),
        })
        .context("initializing sync orchestrator")?;
        let integrations = IntegrationService::new(
            db.clone(),
            vault.clone(),
            orchestrator.clone(),
            cancellations.clone(),
            clock.clone(),
        );

        Ok(Self {
            config,
            db,
            vault,
            locks,
            cancellations,
            oauth,
            orchestrator,
            integrations,
            clock,
        })
    }

    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(
            self.config.scheduler.clone(),
            IntegrationRepository::new(self.db.clone()),
            self.orchestrator.clone(),
            self.clock.clone(),
        )
    }

    pub fn token_refresh(&self) -> TokenRefreshService {
        TokenRefreshService::new(
            self.config.token_refresh.clone(),
            self.db.clone(),
            self.vault.clone(),
            self.oauth.clone(),
            self.locks.clone(),
            std::time::Duration::from_secs(self.config.sync.lock_lease_seconds),
            self.clock.clone(),
        )
    }
}

/// Run the scheduler and token refresh loops until `shutdown` fires.
pub async fn run_background(state: AppState, shutdown: CancellationToken) -> Result<()> {
    info!(profile = %state.config.profile, "Starting background services");

    let scheduler = tokio::spawn(state.scheduler().run(shutdown.clone()));
    let token_refresh = tokio::spawn(state.token_refresh().run(shutdown.clone()));

    for (name, handle) in [("scheduler", scheduler), ("token_refresh", token_refresh)] {
        if let Err(err) = handle.await {
            error!(service = name, error = ?err, "Background service terminated abnormally");
        }
    }

    info!("Background services stopped");
    Ok(())
}
