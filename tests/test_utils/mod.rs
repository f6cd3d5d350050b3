//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations applied, a deterministic app state wired
//! to a [`MockClock`], fixture inserts and scripted fake providers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use integrations::app::AppState;
use integrations::clock::{Clock, MockClock, SharedClock};
use integrations::config::{AppConfig, OAuthClientConfig};
use integrations::models::integration::{Model as IntegrationModel, credential_aad};
use integrations::models::{Credentials, IntegrationConfig, ProviderType, SyncType};
use integrations::providers::{ProviderError, ProviderRegistry, SyncProvider, SyncReport};
use integrations::repositories::{IntegrationRepository, NewIntegration};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::Notify;
use uuid::Uuid;

pub const TEST_CRYPTO_KEY: [u8; 32] = [7u8; 32];

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration for tests: fixed key, no retry jitter surprises.
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        crypto_key: Some(TEST_CRYPTO_KEY.to_vec()),
        oauth_redirect_uri: "https://app.example.com/oauth/callback".to_string(),
        ..AppConfig::default()
    }
}

/// Point the GitHub OAuth client at a mock server.
pub fn with_github_oauth(mut config: AppConfig, server_uri: &str) -> AppConfig {
    config.oauth_clients.insert(
        ProviderType::Github.as_str().to_string(),
        OAuthClientConfig {
            client_id: Some("test-client-id".to_string()),
            client_secret: Some("test-client-secret".to_string()),
            authorize_url: Some(format!("{server_uri}/login/oauth/authorize")),
            token_url: Some(format!("{server_uri}/login/oauth/access_token")),
            api_base: Some(server_uri.to_string()),
        },
    );
    config
}

/// Fully wired application state on a fresh database.
pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<MockClock>,
}

impl TestApp {
    pub async fn new(config: AppConfig, providers: Vec<Arc<dyn SyncProvider>>) -> Result<Self> {
        let db = setup_test_db().await?;
        let clock = Arc::new(MockClock::new());
        let shared: SharedClock = clock.clone();

        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider);
        }

        let state = AppState::with_registry(config, db, shared, registry, reqwest::Client::new())?;
        Ok(Self { state, clock })
    }

    pub async fn with_provider(config: AppConfig, provider: Arc<dyn SyncProvider>) -> Result<Self> {
        Self::new(config, vec![provider]).await
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn integrations(&self) -> IntegrationRepository {
        IntegrationRepository::new(self.state.db.clone())
    }

    pub async fn reload(&self, id: Uuid) -> Result<IntegrationModel> {
        self.integrations()
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("integration {id} missing"))
    }

    /// Insert an integration with sealed credentials.
    pub async fn insert_integration(
        &self,
        org_id: Uuid,
        provider: ProviderType,
        credentials: Credentials,
        sync_interval_seconds: Option<i64>,
    ) -> Result<IntegrationModel> {
        let id = Uuid::new_v4();
        let token_expires_at = match &credentials {
            Credentials::OAuth { expires_at, .. } => *expires_at,
            _ => None,
        };
        let sealed = self.state.vault.seal_config(
            &credential_aad(org_id, provider.as_str(), id),
            &IntegrationConfig::new(credentials),
        )?;

        let created = self
            .integrations()
            .create(
                NewIntegration {
                    id,
                    org_id,
                    provider,
                    name: format!("{provider} test"),
                    config_ciphertext: sealed,
                    sync_interval_seconds,
                    retry_policy: None,
                    token_expires_at,
                },
                self.clock.now(),
            )
            .await?;
        Ok(created)
    }

    pub async fn insert_api_key_integration(
        &self,
        org_id: Uuid,
        provider: ProviderType,
    ) -> Result<IntegrationModel> {
        self.insert_integration(
            org_id,
            provider,
            Credentials::ApiKey {
                api_key: "test-api-key".to_string(),
            },
            None,
        )
        .await
    }

    pub async fn insert_oauth_integration(
        &self,
        org_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IntegrationModel> {
        self.insert_integration(
            org_id,
            ProviderType::Github,
            Credentials::OAuth {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.map(str::to_string),
                expires_at,
                scopes: vec!["repo".to_string()],
            },
            None,
        )
        .await
    }
}

/// Provider that replays scripted results, then keeps succeeding.
pub struct ScriptedProvider {
    provider_type: ProviderType,
    script: Mutex<VecDeque<Result<SyncReport, ProviderError>>>,
    calls: AtomicU32,
    tokens_seen: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(
        provider_type: ProviderType,
        script: Vec<Result<SyncReport, ProviderError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider_type,
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            tokens_seen: Mutex::new(Vec::new()),
        })
    }

    /// Provider that fails every call with `error`.
    pub fn always_failing(provider_type: ProviderType, error: ProviderError, times: usize) -> Arc<Self> {
        Self::new(provider_type, vec![Err(error); times])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncProvider for ScriptedProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn execute_sync(
        &self,
        config: &IntegrationConfig,
        _sync_type: SyncType,
    ) -> Result<SyncReport, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Some(token), Ok(mut seen)) = (config.bearer_token(), self.tokens_seen.lock()) {
            seen.push(token.to_string());
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        next.unwrap_or_else(|| Ok(SyncReport::new(1)))
    }
}

/// Provider that parks every call until released, for overlap tests.
pub struct BlockingProvider {
    provider_type: ProviderType,
    pub started: Notify,
    pub release: Notify,
}

impl BlockingProvider {
    pub fn new(provider_type: ProviderType) -> Arc<Self> {
        Arc::new(Self {
            provider_type,
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl SyncProvider for BlockingProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn execute_sync(
        &self,
        _config: &IntegrationConfig,
        _sync_type: SyncType,
    ) -> Result<SyncReport, ProviderError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(SyncReport::new(3))
    }
}

pub fn http_error(status: u16) -> ProviderError {
    ProviderError::Http {
        status,
        body: format!("status {status}"),
        retry_after: None,
    }
}
