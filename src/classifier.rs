//! Error classifier
//!
//! Maps every raw provider failure onto the fixed six-kind taxonomy consulted
//! by the retry executor, the circuit breaker and the sync orchestrator.
//! Classification is a pure function of the error value.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;

/// Failure taxonomy shared by every resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure, timeout or 5xx
    Transient,
    /// 429 or a provider-specific throttling signal
    RateLimited,
    /// 401/403 or an expired-token signal
    AuthFailure,
    /// Malformed or incomplete configuration, detected before any network call
    ConfigError,
    /// 4xx that will never succeed on retry
    Permanent,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds the retry executor may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a provider failure.
pub fn classify(error: &ProviderError) -> ErrorKind {
    match error {
        ProviderError::Network { .. } | ProviderError::Timeout { .. } => ErrorKind::Transient,
        ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
        ProviderError::TokenExpired { .. } => ErrorKind::AuthFailure,
        ProviderError::Configuration { .. } => ErrorKind::ConfigError,
        ProviderError::Http { status, .. } => classify_status(*status),
        ProviderError::MalformedResponse { .. } | ProviderError::Other { .. } => {
            ErrorKind::Unknown
        }
    }
}

/// Classify a bare HTTP status code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        401 | 403 => ErrorKind::AuthFailure,
        408 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        400..=499 => ErrorKind::Permanent,
        _ => ErrorKind::Unknown,
    }
}

/// A classified failure as surfaced to callers and persisted on sync logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider calls made before giving up
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl SyncFailure {
    pub fn from_provider_error(error: &ProviderError) -> Self {
        Self {
            kind: classify(error),
            message: error.to_string(),
            attempts: 1,
            http_status: error.http_status(),
            retry_after_seconds: error.retry_after(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Human-readable text stored as the integration's `last_error`.
    pub fn summary(&self) -> String {
        format!("{} (after {} attempt(s)): {}", self.kind, self.attempts, self.message)
    }
}
