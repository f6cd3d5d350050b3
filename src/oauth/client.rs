//! Token endpoint client.
//!
//! Form-encoded POSTs for the `authorization_code` and `refresh_token`
//! grants. Some providers (GitHub) answer errors with HTTP 200 and an
//! `error` field, so the body is inspected before it is trusted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use super::catalog::ResolvedProvider;
use crate::error::truncate_snippet;

const DEFAULT_RATE_LIMIT_RETRY_SECONDS: u64 = 60;

/// OAuth error codes meaning the grant or client will never be accepted.
const REJECTED_GRANT_CODES: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client"];

/// Successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .filter(|seconds| *seconds > 0)
            .map(|seconds| now + chrono::Duration::seconds(seconds))
    }

    /// Granted scopes; providers separate them with spaces or commas.
    pub fn granted_scopes(&self) -> Option<Vec<String>> {
        self.scope.as_ref().map(|scope| {
            scope
                .split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Grant presented to the token endpoint.
#[derive(Debug, Clone)]
pub enum TokenGrant<'a> {
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: Option<&'a str>,
    },
    RefreshToken {
        refresh_token: &'a str,
    },
}

/// Token endpoint failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenEndpointError {
    /// The provider refused the code, refresh token or client outright
    #[error("token request rejected ({code}): {description}")]
    Rejected {
        code: String,
        description: String,
        status: u16,
    },
    #[error("token endpoint rate limited; retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("token endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("token request failed: {0}")]
    Network(String),
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl TokenEndpointError {
    /// True when re-running the same grant can never succeed.
    pub fn is_rejected_grant(&self) -> bool {
        matches!(self, TokenEndpointError::Rejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TokenEndpointError::Rejected { status, .. } | TokenEndpointError::Http { status, .. } => {
                Some(*status)
            }
            TokenEndpointError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// HTTP client for provider token endpoints.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn request_token(
        &self,
        provider: &ResolvedProvider,
        grant: TokenGrant<'_>,
    ) -> Result<TokenResponse, TokenEndpointError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ];
        match grant {
            TokenGrant::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
            } => {
                params.push(("grant_type", "authorization_code"));
                params.push(("code", code));
                params.push(("redirect_uri", redirect_uri));
                if let Some(verifier) = code_verifier {
                    params.push(("code_verifier", verifier));
                }
            }
            TokenGrant::RefreshToken { refresh_token } => {
                params.push(("grant_type", "refresh_token"));
                params.push(("refresh_token", refresh_token));
            }
        }

        self.post_form(&provider.token_url, &params).await
    }

    async fn post_form(
        &self,
        token_url: &Url,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, TokenEndpointError> {
        let response = self
            .http
            .post(token_url.clone())
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .form(params)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_RETRY_SECONDS);
            return Err(TokenEndpointError::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Network(e.to_string()))?;
        debug!(status = status.as_u16(), "Token endpoint responded");

        let parsed: Option<JsonValue> = serde_json::from_str(&body).ok();
        if let Some(error) = parsed.as_ref().and_then(oauth_error) {
            return Err(classify_oauth_error(error, status.as_u16()));
        }

        if !status.is_success() {
            return Err(TokenEndpointError::Http {
                status: status.as_u16(),
                body: truncate_snippet(&body),
            });
        }

        let value = parsed.ok_or_else(|| {
            TokenEndpointError::InvalidResponse(format!("non-JSON body: {}", truncate_snippet(&body)))
        })?;
        serde_json::from_value(value).map_err(|e| TokenEndpointError::InvalidResponse(e.to_string()))
    }
}

struct OAuthErrorBody {
    code: String,
    description: String,
}

fn oauth_error(body: &JsonValue) -> Option<OAuthErrorBody> {
    let code = body.get("error")?.as_str()?.to_string();
    let description = body
        .get("error_description")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    Some(OAuthErrorBody { code, description })
}

fn classify_oauth_error(error: OAuthErrorBody, status: u16) -> TokenEndpointError {
    let code = error.code.to_lowercase();
    if REJECTED_GRANT_CODES.contains(&code.as_str()) || code == "bad_verification_code" {
        return TokenEndpointError::Rejected {
            code,
            description: truncate_snippet(&error.description),
            status,
        };
    }
    if code.contains("rate_limit") || code == "slow_down" || code == "temporarily_unavailable" {
        return TokenEndpointError::RateLimited {
            retry_after: DEFAULT_RATE_LIMIT_RETRY_SECONDS,
        };
    }
    TokenEndpointError::Http {
        status,
        body: truncate_snippet(&format!("{}: {}", error.code, error.description)),
    }
}
