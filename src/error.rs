//! # Error Handling
//!
//! Framework-level errors surfaced by the integration core. Provider failures
//! are not represented here: they are classified by [`crate::classifier`] and
//! reported as part of a [`crate::sync::SyncOutcome`].

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::models::ProviderType;
use crate::providers::RegistryError;

const SNIPPET_MAX_CHARS: usize = 200;

/// Errors returned by the OAuth connector, sync orchestrator and services.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("circuit breaker is open for integration {integration_id}")]
    CircuitOpen {
        integration_id: Uuid,
        /// Seconds until the breaker allows a trial sync
        retry_after_seconds: u64,
    },

    #[error("a sync is already in progress for integration {integration_id}")]
    SyncAlreadyInProgress { integration_id: Uuid },

    #[error("OAuth state is invalid or has expired")]
    InvalidOrExpiredState,

    #[error("OAuth client is not configured for provider {provider}")]
    ProviderNotConfigured { provider: ProviderType },

    #[error("OAuth token exchange failed: {message}")]
    OAuthExchangeFailed {
        message: String,
        status: Option<u16>,
    },

    #[error("stored credentials for integration {integration_id} cannot be decrypted; re-authorization required")]
    CorruptCredential {
        integration_id: Uuid,
        #[source]
        source: CryptoError,
    },

    #[error("integration {0} not found")]
    IntegrationNotFound(Uuid),

    #[error("integration {integration_id} requires re-authorization")]
    ReauthorizationRequired { integration_id: Uuid },

    #[error("integration {integration_id} is inactive")]
    IntegrationInactive { integration_id: Uuid },

    #[error("no sync provider registered for {provider}")]
    ProviderNotRegistered { provider: ProviderType },

    #[error("sync for integration {integration_id} was cancelled")]
    Cancelled { integration_id: Uuid },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntegrationError {
    /// Expected outcomes where no provider call was attempted. These never
    /// count toward consecutive failures.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            IntegrationError::CircuitOpen { .. } | IntegrationError::SyncAlreadyInProgress { .. }
        )
    }

    /// True when the user must re-run the OAuth flow before syncing again.
    pub fn needs_reauthorization(&self) -> bool {
        matches!(
            self,
            IntegrationError::CorruptCredential { .. }
                | IntegrationError::ReauthorizationRequired { .. }
        )
    }

    /// Stable snake_case code, used on sync logs and in CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            IntegrationError::CircuitOpen { .. } => "circuit_open",
            IntegrationError::SyncAlreadyInProgress { .. } => "sync_already_in_progress",
            IntegrationError::InvalidOrExpiredState => "invalid_or_expired_state",
            IntegrationError::ProviderNotConfigured { .. } => "provider_not_configured",
            IntegrationError::OAuthExchangeFailed { .. } => "oauth_exchange_failed",
            IntegrationError::CorruptCredential { .. } => "corrupt_credential",
            IntegrationError::IntegrationNotFound(_) => "integration_not_found",
            IntegrationError::ReauthorizationRequired { .. } => "reauthorization_required",
            IntegrationError::IntegrationInactive { .. } => "integration_inactive",
            IntegrationError::ProviderNotRegistered { .. } => "provider_not_registered",
            IntegrationError::Cancelled { .. } => "cancelled",
            IntegrationError::InvalidConfig(_) => "invalid_config",
            IntegrationError::Database(_) => "database",
            IntegrationError::Internal(_) => "internal",
        }
    }
}

impl From<RegistryError> for IntegrationError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::ProviderNotRegistered { provider } => {
                IntegrationError::ProviderNotRegistered { provider }
            }
        }
    }
}

impl From<ConfigError> for IntegrationError {
    fn from(error: ConfigError) -> Self {
        IntegrationError::InvalidConfig(error.to_string())
    }
}

impl From<serde_json::Error> for IntegrationError {
    fn from(error: serde_json::Error) -> Self {
        IntegrationError::Internal(format!("serialization failed: {error}"))
    }
}

/// Bound a provider response body before it reaches error text or logs.
pub fn truncate_snippet(body: &str) -> String {
    if body.chars().count() > SNIPPET_MAX_CHARS {
        let truncated: String = body.chars().take(SNIPPET_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Whether a database error is a unique constraint violation.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}
