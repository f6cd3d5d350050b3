//! Built-in OAuth endpoint catalog.
//!
//! Each OAuth-capable provider type has default endpoints, scopes and extra
//! authorize parameters. Any endpoint can be overridden from configuration;
//! Okta has no public default and always needs overrides.

use url::Url;

use crate::config::OAuthClientConfig;
use crate::models::ProviderType;

struct CatalogEntry {
    authorize_url: Option<&'static str>,
    token_url: Option<&'static str>,
    default_scopes: &'static [&'static str],
    scope_separator: &'static str,
    uses_pkce: bool,
    extra_params: &'static [(&'static str, &'static str)],
}

fn entry(provider: ProviderType) -> Option<CatalogEntry> {
    let entry = match provider {
        ProviderType::Github => CatalogEntry {
            authorize_url: Some("https://github.com/login/oauth/authorize"),
            token_url: Some("https://github.com/login/oauth/access_token"),
            default_scopes: &["repo", "read:org"],
            scope_separator: " ",
            uses_pkce: false,
            extra_params: &[],
        },
        ProviderType::Gitlab => CatalogEntry {
            authorize_url: Some("https://gitlab.com/oauth/authorize"),
            token_url: Some("https://gitlab.com/oauth/token"),
            default_scopes: &["read_api", "read_user"],
            scope_separator: " ",
            uses_pkce: true,
            extra_params: &[],
        },
        ProviderType::Jira => CatalogEntry {
            authorize_url: Some("https://auth.atlassian.com/authorize"),
            token_url: Some("https://auth.atlassian.com/oauth/token"),
            default_scopes: &["read:jira-work", "read:jira-user", "offline_access"],
            scope_separator: " ",
            uses_pkce: false,
            extra_params: &[("audience", "api.atlassian.com"), ("prompt", "consent")],
        },
        ProviderType::GoogleWorkspace => CatalogEntry {
            authorize_url: Some("https://accounts.google.com/o/oauth2/v2/auth"),
            token_url: Some("https://oauth2.googleapis.com/token"),
            default_scopes: &[
                "https://www.googleapis.com/auth/admin.directory.user.readonly",
                "https://www.googleapis.com/auth/admin.reports.audit.readonly",
            ],
            scope_separator: " ",
            uses_pkce: true,
            extra_params: &[("access_type", "offline"), ("prompt", "consent")],
        },
        ProviderType::Okta => CatalogEntry {
            authorize_url: None,
            token_url: None,
            default_scopes: &["okta.users.read", "okta.groups.read", "offline_access"],
            scope_separator: " ",
            uses_pkce: true,
            extra_params: &[],
        },
        ProviderType::Aws => return None,
    };
    Some(entry)
}

/// Endpoints and client credentials ready for one authorization flow.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub provider: ProviderType,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub default_scopes: Vec<String>,
    pub scope_separator: &'static str,
    pub uses_pkce: bool,
    pub extra_params: &'static [(&'static str, &'static str)],
}

/// Merge the catalog with configured client settings.
///
/// Returns `None` when the provider has no OAuth flow, its client id or
/// secret is missing, or an endpoint is neither built in nor configured.
pub fn resolve(provider: ProviderType, client: Option<&OAuthClientConfig>) -> Option<ResolvedProvider> {
    let entry = entry(provider)?;
    let client = client?;
    let (client_id, client_secret) = client.credentials()?;

    let authorize_url = client
        .authorize_url
        .as_deref()
        .or(entry.authorize_url)
        .and_then(|raw| Url::parse(raw).ok())?;
    let token_url = client
        .token_url
        .as_deref()
        .or(entry.token_url)
        .and_then(|raw| Url::parse(raw).ok())?;

    Some(ResolvedProvider {
        provider,
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        authorize_url,
        token_url,
        default_scopes: entry.default_scopes.iter().map(|s| s.to_string()).collect(),
        scope_separator: entry.scope_separator,
        uses_pkce: entry.uses_pkce,
        extra_params: entry.extra_params,
    })
}

impl ResolvedProvider {
    /// Authorize URL the user is redirected to.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        scopes: &[String],
        code_challenge: Option<&str>,
    ) -> Url {
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state)
                .append_pair("scope", &scopes.join(self.scope_separator));
            if let Some(challenge) = code_challenge {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", super::pkce::CHALLENGE_METHOD);
            }
            for (key, value) in self.extra_params {
                query.append_pair(key, value);
            }
        }
        url
    }
}

/// Provider types with a built-in OAuth flow.
pub fn oauth_providers() -> Vec<ProviderType> {
    ProviderType::ALL
        .iter()
        .copied()
        .filter(|provider| entry(*provider).is_some())
        .collect()
}
