//! Provider registry
//!
//! Lookup table from provider type to its sync capability.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{GitHubProvider, SyncProvider};
use crate::config::AppConfig;
use crate::models::ProviderType;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no sync provider registered for '{provider}'")]
    ProviderNotRegistered { provider: ProviderType },
}

/// Registry of sync providers keyed by provider type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderType, Arc<dyn SyncProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with every provider shipped in this crate.
    pub fn with_defaults(config: &AppConfig, http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        let api_base = config
            .oauth_client(ProviderType::Github)
            .and_then(|client| client.api_base.clone());
        registry.register(Arc::new(GitHubProvider::new(http, api_base)));
        registry
    }

    /// Register a provider, replacing any previous registration for its type
    pub fn register(&mut self, provider: Arc<dyn SyncProvider>) {
        let provider_type = provider.provider_type();
        debug!(provider = %provider_type, "Registering sync provider");
        self.providers.insert(provider_type, provider);
    }

    /// Get the provider for a type
    pub fn get(&self, provider: ProviderType) -> Result<Arc<dyn SyncProvider>, RegistryError> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::ProviderNotRegistered { provider })
    }

    /// Registered provider types, sorted by name
    pub fn provider_types(&self) -> Vec<ProviderType> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort_by_key(|p| p.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntegrationConfig, SyncType};
    use crate::providers::{ProviderError, SyncReport};
    use async_trait::async_trait;

    struct StaticProvider(ProviderType);

    #[async_trait]
    impl SyncProvider for StaticProvider {
        fn provider_type(&self) -> ProviderType {
            self.0
        }

        async fn execute_sync(
            &self,
            _config: &IntegrationConfig,
            _sync_type: SyncType,
        ) -> Result<SyncReport, ProviderError> {
            Ok(SyncReport::new(1))
        }
    }

    #[test]
    fn unregistered_provider_is_an_error() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get(ProviderType::Okta),
            Err(RegistryError::ProviderNotRegistered {
                provider: ProviderType::Okta
            })
        ));
    }

    #[test]
    fn register_replaces_and_lists_sorted() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider(ProviderType::Okta)));
        registry.register(Arc::new(StaticProvider(ProviderType::Aws)));
        registry.register(Arc::new(StaticProvider(ProviderType::Okta)));

        assert_eq!(
            registry.provider_types(),
            vec![ProviderType::Aws, ProviderType::Okta]
        );
        assert!(registry.get(ProviderType::Aws).is_ok());
    }

    #[test]
    fn defaults_include_github() {
        let registry = ProviderRegistry::with_defaults(&AppConfig::default(), reqwest::Client::new());
        assert!(registry.get(ProviderType::Github).is_ok());
    }
}
