//! Provider capability layer
//!
//! Each supported provider implements [`SyncProvider`] once and is registered
//! in the [`ProviderRegistry`] under its [`ProviderType`]. The orchestrator
//! never branches on provider type itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{IntegrationConfig, ProviderType, SyncType};

pub mod github;
pub mod registry;

pub use github::GitHubProvider;
pub use registry::{ProviderRegistry, RegistryError};

/// Raw failure returned by a provider call, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Non-success HTTP response from the provider API
    #[error("provider returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<u64>,
    },
    /// Connection, DNS or TLS failure
    #[error("network error: {details}")]
    Network { details: String },
    /// The call did not finish within its deadline
    #[error("provider call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    /// Provider-specific throttling signal outside plain 429 responses
    #[error("rate limited by provider: {details}")]
    RateLimited {
        retry_after: Option<u64>,
        details: String,
    },
    /// Provider signalled the access token is expired or revoked
    #[error("access token rejected: {details}")]
    TokenExpired { details: String },
    /// Integration configuration cannot be used (missing field, wrong credential type)
    #[error("invalid integration configuration: {details}")]
    Configuration { details: String },
    /// Response could not be parsed
    #[error("malformed provider response: {details}")]
    MalformedResponse { details: String },
    #[error("{details}")]
    Other { details: String },
}

impl ProviderError {
    pub fn configuration(details: impl Into<String>) -> Self {
        ProviderError::Configuration {
            details: details.into(),
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::Http { retry_after, .. }
            | ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout { after_ms: 0 }
        } else if err.is_decode() {
            ProviderError::MalformedResponse {
                details: err.to_string(),
            }
        } else {
            ProviderError::Network {
                details: err.to_string(),
            }
        }
    }
}

/// Result of one successful provider sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub records_processed: u64,
}

impl SyncReport {
    pub fn new(records_processed: u64) -> Self {
        Self { records_processed }
    }
}

/// Uniform "execute one sync" capability implemented once per provider.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Pull data for one integration with its decrypted configuration.
    async fn execute_sync(
        &self,
        config: &IntegrationConfig,
        sync_type: SyncType,
    ) -> Result<SyncReport, ProviderError>;
}
