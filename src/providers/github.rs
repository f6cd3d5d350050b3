//! GitHub sync provider
//!
//! Walks the repositories visible to the integration's token and reports how
//! many were seen. Mapping repositories into evidence records happens
//! downstream of this crate.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{ProviderError, SyncProvider, SyncReport};
use crate::error::truncate_snippet;
use crate::models::{IntegrationConfig, ProviderType, SyncType};

pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "integrations-sync/0.1";
const ACCEPT: &str = "application/vnd.github+json";
const PER_PAGE: u32 = 100;
const DEFAULT_MAX_PAGES: u64 = 50;

#[derive(Debug, Deserialize)]
struct RepositorySummary {
    #[allow(dead_code)]
    id: u64,
}

/// GitHub provider backed by the REST API.
pub struct GitHubProvider {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubProvider {
    pub fn new(http: reqwest::Client, api_base: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn first_page_url(&self, config: &IntegrationConfig) -> String {
        match config.option_str("organization") {
            Some(org) => format!(
                "{}/orgs/{}/repos?per_page={}",
                self.api_base, org, PER_PAGE
            ),
            None => format!("{}/user/repos?per_page={}", self.api_base, PER_PAGE),
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Vec<RepositorySummary>, Option<String>), ProviderError> {
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let next = response
            .headers()
            .get("Link")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);

        let repos = response
            .json::<Vec<RepositorySummary>>()
            .await
            .map_err(|e| ProviderError::MalformedResponse {
                details: e.to_string(),
            })?;

        Ok((repos, next))
    }
}

#[async_trait]
impl SyncProvider for GitHubProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Github
    }

    #[instrument(skip_all, fields(sync_type = %sync_type))]
    async fn execute_sync(
        &self,
        config: &IntegrationConfig,
        sync_type: SyncType,
    ) -> Result<SyncReport, ProviderError> {
        let token = config
            .bearer_token()
            .ok_or_else(|| ProviderError::configuration("GitHub requires an OAuth token or API key"))?;

        let max_pages = config
            .options
            .get("max_pages")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_PAGES);

        let mut next_url = Some(self.first_page_url(config));
        let mut pages = 0u64;
        let mut records = 0u64;

        while let Some(url) = next_url.take() {
            if pages >= max_pages {
                warn!(pages, "Stopping GitHub pagination at page limit");
                break;
            }
            let (repos, next) = self.fetch_page(&url, token).await?;
            pages += 1;
            records += repos.len() as u64;
            next_url = next;
        }

        debug!(pages, records, "GitHub sync finished");
        Ok(SyncReport::new(records))
    }
}

async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let headers = response.headers().clone();
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let retry_after = header_u64("Retry-After");

    // Primary rate limit exhaustion arrives as 403 with a zero remaining budget
    if status == StatusCode::FORBIDDEN && header_u64("X-RateLimit-Remaining") == Some(0) {
        let reset_in = header_u64("X-RateLimit-Reset").map(|reset| {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            reset.saturating_sub(now)
        });
        return ProviderError::RateLimited {
            retry_after: retry_after.or(reset_in),
            details: "GitHub API rate limit exhausted".to_string(),
        };
    }

    let body = response.text().await.unwrap_or_default();
    ProviderError::Http {
        status: status.as_u16(),
        body: truncate_snippet(&body),
        retry_after,
    }
}

/// Extract the `rel="next"` target from a GitHub `Link` header.
fn parse_next_link(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let url_part = parts.next()?.trim();
        let is_next = parts.any(|p| p.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let start = url_part.find('<')?;
        let end = url_part.find('>')?;
        Some(url_part[start + 1..end].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_next_link() {
        let header = r#"<https://api.github.com/user/repos?page=2>; rel="next", <https://api.github.com/user/repos?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/user/repos?page=2")
        );
    }

    #[test]
    fn no_next_link_on_last_page() {
        let header = r#"<https://api.github.com/user/repos?page=1>; rel="prev""#;
        assert_eq!(parse_next_link(header), None);
    }

    #[test]
    fn organization_option_changes_endpoint() {
        let provider = GitHubProvider::new(reqwest::Client::new(), Some("http://gh.local/".into()));
        let mut config = IntegrationConfig::new(crate::models::Credentials::ApiKey {
            api_key: "t".into(),
        });
        assert_eq!(
            provider.first_page_url(&config),
            "http://gh.local/user/repos?per_page=100"
        );

        config
            .options
            .insert("organization".into(), serde_json::json!("acme"));
        assert_eq!(
            provider.first_page_url(&config),
            "http://gh.local/orgs/acme/repos?per_page=100"
        );
    }
}
