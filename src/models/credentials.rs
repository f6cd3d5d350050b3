//! Decrypted integration configuration.
//!
//! This is the plaintext shape of `integrations.config_ciphertext`. It only
//! ever exists in memory; the vault seals it before persistence.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Credentials plus provider-specific options for one integration.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationConfig {
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

/// Secret material used to authenticate against a provider.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Tokens obtained through the authorization-code grant.
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
    },
    /// Static API token entered during manual setup.
    ApiKey { api_key: String },
    /// Key pair style credentials (cloud providers).
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
    },
}

impl IntegrationConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            options: Map::new(),
        }
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    /// Bearer token usable in an `Authorization` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::OAuth { access_token, .. } => Some(access_token),
            Credentials::ApiKey { api_key } => Some(api_key),
            Credentials::AccessKey { .. } => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::OAuth { refresh_token, .. } => refresh_token.as_deref(),
            _ => None,
        }
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        match &self.credentials {
            Credentials::OAuth { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    /// True when the OAuth access token expires within `lead_time` of `now`.
    pub fn token_expires_within(&self, now: DateTime<Utc>, lead_time: Duration) -> bool {
        self.token_expires_at()
            .is_some_and(|expires_at| expires_at <= now + lead_time)
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.credentials, Credentials::OAuth { .. })
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for IntegrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationConfig")
            .field("credentials", &self.credentials)
            .field("options", &self.options)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::OAuth {
                refresh_token,
                expires_at,
                scopes,
                ..
            } => f
                .debug_struct("OAuth")
                .field("access_token", &"[REDACTED]")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "[REDACTED]"))
                .field("expires_at", expires_at)
                .field("scopes", scopes)
                .finish(),
            Credentials::ApiKey { .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"[REDACTED]")
                .finish(),
            Credentials::AccessKey { access_key_id, .. } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"[REDACTED]")
                .finish(),
        }
    }
}
