//! Configuration loading for the integration service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INTEGRATIONS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ProviderType;

const ENV_PREFIX: &str = "INTEGRATIONS_";
const REDACTED: &str = "[REDACTED]";

/// Upper bound for configured periods (lease, breaker reset, overdue grace): one week.
pub const MAX_PERIOD_SECONDS: u64 = 7 * 86_400;

/// Application configuration derived from `INTEGRATIONS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default = "default_oauth_redirect_uri")]
    pub oauth_redirect_uri: String,
    #[serde(default = "default_oauth_session_ttl_seconds")]
    pub oauth_session_ttl_seconds: u64,
    /// OAuth client settings keyed by provider type (`github`, `okta`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub oauth_clients: BTreeMap<String, OAuthClientConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
}

/// Client registration for one OAuth provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OAuthClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Overrides the catalog authorize endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,
    /// Overrides the catalog token endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// Base URL for the provider's data API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl OAuthClientConfig {
    /// Client id and secret, when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let id = self.client_id.as_deref().filter(|v| !v.is_empty())?;
        let secret = self.client_secret.as_deref().filter(|v| !v.is_empty())?;
        Some((id, secret))
    }
}

/// Sync pipeline defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Upper bound on a single provider call (default: 60)
    #[serde(default = "default_sync_provider_timeout_seconds")]
    pub provider_timeout_seconds: u64,
    /// Lease on the persisted `syncing` status (default: 3600)
    #[serde(default = "default_sync_lock_lease_seconds")]
    pub lock_lease_seconds: u64,
    #[serde(default = "default_true")]
    pub retry_enabled: bool,
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_sync_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_sync_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_reset_seconds")]
    pub reset_seconds: u64,
}

/// Health aggregation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HealthConfig {
    /// Number of recent sync logs averaged for duration
    #[serde(default = "default_health_duration_window")]
    pub duration_window: u64,
    /// Slack added to the cadence before an integration counts as overdue
    #[serde(default = "default_health_overdue_grace_seconds")]
    pub overdue_grace_seconds: u64,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_scheduler_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_scheduler_jitter_pct_min")]
    pub jitter_pct_min: f64,
    #[serde(default = "default_scheduler_jitter_pct_max")]
    pub jitter_pct_max: f64,
}

/// Token refresh service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Background refresh interval in seconds (default: 300)
    #[serde(default = "default_token_refresh_tick_seconds")]
    pub tick_seconds: u64,

    /// Lead time before expiry to trigger refresh in seconds (default: 600)
    #[serde(default = "default_token_refresh_lead_time_seconds")]
    pub lead_time_seconds: u64,

    /// Maximum number of concurrent refresh operations (default: 4)
    #[serde(default = "default_token_refresh_concurrency")]
    pub concurrency: u32,

    /// Jitter factor to avoid thundering herd (default: 0.1)
    #[serde(default = "default_token_refresh_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            oauth_redirect_uri: default_oauth_redirect_uri(),
            oauth_session_ttl_seconds: default_oauth_session_ttl_seconds(),
            oauth_clients: BTreeMap::new(),
            sync: SyncConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            scheduler: SchedulerConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provider_timeout_seconds: default_sync_provider_timeout_seconds(),
            lock_lease_seconds: default_sync_lock_lease_seconds(),
            retry_enabled: true,
            max_attempts: default_sync_max_attempts(),
            backoff_base_ms: default_sync_backoff_base_ms(),
            backoff_max_ms: default_sync_backoff_max_ms(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            reset_seconds: default_breaker_reset_seconds(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            duration_window: default_health_duration_window(),
            overdue_grace_seconds: default_health_overdue_grace_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            concurrency: default_scheduler_concurrency(),
            jitter_pct_min: default_scheduler_jitter_pct_min(),
            jitter_pct_max: default_scheduler_jitter_pct_max(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_token_refresh_tick_seconds(),
            lead_time_seconds: default_token_refresh_lead_time_seconds(),
            concurrency: default_token_refresh_concurrency(),
            jitter_factor: default_token_refresh_jitter_factor(),
        }
    }
}

impl AppConfig {
    /// Whether a missing crypto key must abort startup.
    pub fn encryption_required(&self) -> bool {
        !matches!(self.profile.as_str(), "local" | "test")
    }

    /// OAuth client settings for a provider, if any were configured.
    pub fn oauth_client(&self, provider: ProviderType) -> Option<&OAuthClientConfig> {
        self.oauth_clients.get(provider.as_str())
    }

    pub fn oauth_session_ttl(&self) -> Duration {
        Duration::from_secs(self.oauth_session_ttl_seconds)
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        for client in config.oauth_clients.values_mut() {
            if client.client_secret.is_some() {
                client.client_secret = Some(REDACTED.to_string());
            }
        }
        if let Some(scheme_end) = config.database_url.find("://")
            && let Some(at) = config.database_url.rfind('@')
            && at > scheme_end
        {
            config.database_url = format!(
                "{}{}{}",
                &config.database_url[..scheme_end + 3],
                REDACTED,
                &config.database_url[at..]
            );
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            None if self.encryption_required() => {
                return Err(ConfigError::MissingCryptoKey {
                    profile: self.profile.clone(),
                });
            }
            _ => {}
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.oauth_session_ttl_seconds < 60 || self.oauth_session_ttl_seconds > 3600 {
            return Err(ConfigError::InvalidOAuthSessionTtl {
                value: self.oauth_session_ttl_seconds,
            });
        }

        self.sync.validate()?;
        self.breaker.validate()?;
        self.health.validate()?;
        self.scheduler.validate()?;
        self.token_refresh.validate()?;

        Ok(())
    }
}

impl SyncConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_timeout_seconds == 0 {
            return Err(ConfigError::InvalidSyncTimeout {
                value: self.provider_timeout_seconds,
            });
        }
        if self.lock_lease_seconds < self.provider_timeout_seconds
            || self.lock_lease_seconds > MAX_PERIOD_SECONDS
        {
            return Err(ConfigError::InvalidSyncLockLease {
                value: self.lock_lease_seconds,
                min: self.provider_timeout_seconds,
                max: MAX_PERIOD_SECONDS,
            });
        }
        if self.max_attempts == 0 || self.max_attempts > 10 {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.max_attempts,
            });
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidRetryBackoff {
                base: self.backoff_base_ms,
                max: self.backoff_max_ms,
            });
        }
        Ok(())
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold {
                value: self.failure_threshold,
            });
        }
        if self.reset_seconds == 0 || self.reset_seconds > MAX_PERIOD_SECONDS {
            return Err(ConfigError::InvalidBreakerReset {
                value: self.reset_seconds,
                max: MAX_PERIOD_SECONDS,
            });
        }
        Ok(())
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_window == 0 || self.duration_window > 1000 {
            return Err(ConfigError::InvalidHealthDurationWindow {
                value: self.duration_window,
            });
        }
        if self.overdue_grace_seconds > MAX_PERIOD_SECONDS {
            return Err(ConfigError::InvalidHealthOverdueGrace {
                value: self.overdue_grace_seconds,
                max: MAX_PERIOD_SECONDS,
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 10 || self.tick_interval_seconds > 300 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        if self.concurrency == 0 || self.concurrency > 64 {
            return Err(ConfigError::InvalidSchedulerConcurrency {
                value: self.concurrency,
            });
        }

        if self.jitter_pct_min < 0.0 || self.jitter_pct_min > 1.0 {
            return Err(ConfigError::InvalidSchedulerJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "minimum percentage".to_string(),
            });
        }

        if self.jitter_pct_max < 0.0 || self.jitter_pct_max > 1.0 {
            return Err(ConfigError::InvalidSchedulerJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "maximum percentage".to_string(),
            });
        }

        if self.jitter_pct_min > self.jitter_pct_max {
            return Err(ConfigError::InvalidSchedulerJitterInverted {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
            });
        }

        Ok(())
    }
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds < 60 {
            return Err(ConfigError::InvalidTokenRefreshTickInterval {
                value: self.tick_seconds,
            });
        }

        if self.lead_time_seconds < 60 || self.lead_time_seconds > 86400 {
            return Err(ConfigError::InvalidTokenRefreshLeadTime {
                value: self.lead_time_seconds,
            });
        }

        if self.concurrency == 0 || self.concurrency > 20 {
            return Err(ConfigError::InvalidTokenRefreshConcurrency {
                value: self.concurrency,
            });
        }

        if self.jitter_factor < 0.0 || self.jitter_factor > 1.0 {
            return Err(ConfigError::InvalidTokenRefreshJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://integrations.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_oauth_redirect_uri() -> String {
    "http://localhost:8080/oauth/callback".to_string()
}

fn default_oauth_session_ttl_seconds() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_sync_provider_timeout_seconds() -> u64 {
    60
}

fn default_sync_lock_lease_seconds() -> u64 {
    3600
}

fn default_sync_max_attempts() -> u32 {
    3
}

fn default_sync_backoff_base_ms() -> u64 {
    1000
}

fn default_sync_backoff_max_ms() -> u64 {
    300_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_reset_seconds() -> u64 {
    600
}

fn default_health_duration_window() -> u64 {
    20
}

fn default_health_overdue_grace_seconds() -> u64 {
    300
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60
}

fn default_scheduler_concurrency() -> u32 {
    8
}

fn default_scheduler_jitter_pct_min() -> f64 {
    0.0
}

fn default_scheduler_jitter_pct_max() -> f64 {
    0.1
}

fn default_token_refresh_tick_seconds() -> u64 {
    300
}

fn default_token_refresh_lead_time_seconds() -> u64 {
    600
}

fn default_token_refresh_concurrency() -> u32 {
    4
}

fn default_token_refresh_jitter_factor() -> f64 {
    0.1
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for INTEGRATIONS_{key}")]
    InvalidValue { key: String, value: String },
    #[error("crypto key is missing in profile '{profile}'; set INTEGRATIONS_CRYPTO_KEY")]
    MissingCryptoKey { profile: String },
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("OAuth session TTL must be between 60 and 3600 seconds, got {value}")]
    InvalidOAuthSessionTtl { value: u64 },
    #[error("provider timeout must be positive, got {value}")]
    InvalidSyncTimeout { value: u64 },
    #[error("sync lock lease ({value}s) must be between the provider timeout ({min}s) and {max}s")]
    InvalidSyncLockLease { value: u64, min: u64, max: u64 },
    #[error("retry max attempts must be between 1 and 10, got {value}")]
    InvalidRetryAttempts { value: u32 },
    #[error("retry backoff base ({base}ms) must be positive and not exceed max ({max}ms)")]
    InvalidRetryBackoff { base: u64, max: u64 },
    #[error("circuit breaker failure threshold must be positive, got {value}")]
    InvalidBreakerThreshold { value: u32 },
    #[error("circuit breaker reset period must be between 1 and {max} seconds, got {value}")]
    InvalidBreakerReset { value: u64, max: u64 },
    #[error("health duration window must be between 1 and 1000, got {value}")]
    InvalidHealthDurationWindow { value: u64 },
    #[error("health overdue grace must not exceed {max} seconds, got {value}")]
    InvalidHealthOverdueGrace { value: u64, max: u64 },
    #[error("sync scheduler tick interval must be between 10 and 300 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("sync scheduler concurrency must be between 1 and 64, got {value}")]
    InvalidSchedulerConcurrency { value: u32 },
    #[error("sync scheduler jitter percentage {field} is out of bounds (min: {min}, max: {max})")]
    InvalidSchedulerJitterRange { min: f64, max: f64, field: String },
    #[error(
        "sync scheduler jitter percentage minimum ({min}) cannot be greater than maximum ({max})"
    )]
    InvalidSchedulerJitterInverted { min: f64, max: f64 },
    #[error("token refresh tick interval must be at least 60 seconds, got {value}")]
    InvalidTokenRefreshTickInterval { value: u64 },
    #[error("token refresh lead time must be between 60 and 86400 seconds, got {value}")]
    InvalidTokenRefreshLeadTime { value: u64 },
    #[error("token refresh concurrency must be between 1 and 20, got {value}")]
    InvalidTokenRefreshConcurrency { value: u32 },
    #[error("token refresh jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidTokenRefreshJitter { value: f64 },
}

/// Loads configuration using layered `.env` files and `INTEGRATIONS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);

        let crypto_key = match take_string(&mut layered, "CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let mut oauth_clients = BTreeMap::new();
        for provider in ProviderType::ALL {
            let prefix = format!("OAUTH_{}_", provider.as_str().to_ascii_uppercase());
            let mut take = |suffix: &str| take_string(&mut layered, &format!("{prefix}{suffix}"));
            let client = OAuthClientConfig {
                client_id: take("CLIENT_ID"),
                client_secret: take("CLIENT_SECRET"),
                authorize_url: take("AUTHORIZE_URL"),
                token_url: take("TOKEN_URL"),
                api_base: take("API_BASE"),
            };
            if client != OAuthClientConfig::default() {
                oauth_clients.insert(provider.as_str().to_string(), client);
            }
        }

        let sync = SyncConfig {
            provider_timeout_seconds: take_parsed(
                &mut layered,
                "SYNC_PROVIDER_TIMEOUT_SECONDS",
                default_sync_provider_timeout_seconds,
            )?,
            lock_lease_seconds: take_parsed(
                &mut layered,
                "SYNC_LOCK_LEASE_SECONDS",
                default_sync_lock_lease_seconds,
            )?,
            retry_enabled: take_parsed(&mut layered, "SYNC_RETRY_ENABLED", default_true)?,
            max_attempts: take_parsed(
                &mut layered,
                "SYNC_MAX_ATTEMPTS",
                default_sync_max_attempts,
            )?,
            backoff_base_ms: take_parsed(
                &mut layered,
                "SYNC_BACKOFF_BASE_MS",
                default_sync_backoff_base_ms,
            )?,
            backoff_max_ms: take_parsed(
                &mut layered,
                "SYNC_BACKOFF_MAX_MS",
                default_sync_backoff_max_ms,
            )?,
        };

        let breaker = BreakerConfig {
            failure_threshold: take_parsed(
                &mut layered,
                "BREAKER_FAILURE_THRESHOLD",
                default_breaker_failure_threshold,
            )?,
            reset_seconds: take_parsed(
                &mut layered,
                "BREAKER_RESET_SECONDS",
                default_breaker_reset_seconds,
            )?,
        };

        let health = HealthConfig {
            duration_window: take_parsed(
                &mut layered,
                "HEALTH_DURATION_WINDOW",
                default_health_duration_window,
            )?,
            overdue_grace_seconds: take_parsed(
                &mut layered,
                "HEALTH_OVERDUE_GRACE_SECONDS",
                default_health_overdue_grace_seconds,
            )?,
        };

        let scheduler = SchedulerConfig {
            tick_interval_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_TICK_INTERVAL_SECONDS",
                default_scheduler_tick_interval_seconds,
            )?,
            concurrency: take_parsed(
                &mut layered,
                "SCHEDULER_CONCURRENCY",
                default_scheduler_concurrency,
            )?,
            jitter_pct_min: take_parsed(
                &mut layered,
                "SCHEDULER_JITTER_PCT_MIN",
                default_scheduler_jitter_pct_min,
            )?,
            jitter_pct_max: take_parsed(
                &mut layered,
                "SCHEDULER_JITTER_PCT_MAX",
                default_scheduler_jitter_pct_max,
            )?,
        };

        let token_refresh = TokenRefreshConfig {
            tick_seconds: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_TICK_SECONDS",
                default_token_refresh_tick_seconds,
            )?,
            lead_time_seconds: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_LEAD_TIME_SECONDS",
                default_token_refresh_lead_time_seconds,
            )?,
            concurrency: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_CONCURRENCY",
                default_token_refresh_concurrency,
            )?,
            jitter_factor: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_JITTER_FACTOR",
                default_token_refresh_jitter_factor,
            )?,
        };

        let config = AppConfig {
            profile,
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(
                &mut layered,
                "DB_MAX_CONNECTIONS",
                default_db_max_connections,
            )?,
            db_acquire_timeout_ms: take_parsed(
                &mut layered,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            )?,
            crypto_key,
            oauth_redirect_uri: take_string(&mut layered, "OAUTH_REDIRECT_URI")
                .unwrap_or_else(default_oauth_redirect_uri),
            oauth_session_ttl_seconds: take_parsed(
                &mut layered,
                "OAUTH_SESSION_TTL_SECONDS",
                default_oauth_session_ttl_seconds,
            )?,
            oauth_clients,
            sync,
            breaker,
            health,
            scheduler,
            token_refresh,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ConfigError> {
    match take_string(layered, key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default()),
    }
}
