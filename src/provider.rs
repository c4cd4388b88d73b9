//! Code-hosting provider HTTP client.
//!
//! Authenticates as an installed app (RS256 app JWT exchanged for a
//! short-lived installation access token) or as a user (OAuth code
//! exchange), and pages through list endpoints by following the `Link`
//! header's `rel="next"` URL.
//!
//! A [`ProviderClient`] is a plain value constructed per unit of work;
//! tokens are never cached process-wide. Transient failures are retried
//! with capped exponential backoff, after which iteration terminates and
//! the caller observes a partial stream — safe because all ingestion
//! writes are idempotent upserts.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::time::Duration;

use crate::config::ProviderConfig;

const ITEMS_PER_PAGE: u32 = 100;
const ACCEPT_HEADER: &str = "application/vnd.github.machine-man-preview+json";

/// Retry bounds for transient failures: 1s base, doubling, 30s cap.
const MAX_RETRIES: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Provider failures, classified by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Repository gone, token revoked. Do not retry; the caller marks the
    /// project inactive and preserves already-ingested data.
    #[error("permanent provider failure ({status}) for {url}")]
    Permanent { status: u16, url: String },
}

#[derive(Serialize)]
struct AppJwtClaims {
    iat: u64,
    exp: u64,
    iss: String,
}

/// Build the app-level JWT: issued now, valid 10 minutes, RS256-signed
/// with the configured private key. Rebuilt on demand, never cached.
pub fn create_app_jwt(provider: &ProviderConfig) -> Result<String> {
    let app_id = provider
        .app_id
        .as_deref()
        .context("provider.app_id is not configured")?;
    let private_key = provider
        .private_key
        .as_deref()
        .context("provider.private_key is not configured")?;

    let now = Utc::now().timestamp() as u64;
    let claims = AppJwtClaims {
        iat: now,
        exp: now + 10 * 60,
        iss: app_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
        .context("provider.private_key is not a valid RSA PEM key")?;

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .context("failed to sign app JWT")
}

/// Per-unit-of-work provider client carrying at most one installation
/// token and one user token.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    api_base_url: String,
    http: reqwest::Client,
    installation_token: Option<String>,
    user_token: Option<String>,
}

impl ProviderClient {
    /// Unauthenticated client. Works against public repositories within
    /// the provider's anonymous rate limits.
    pub fn anonymous(provider: &ProviderConfig) -> ProviderClient {
        ProviderClient {
            api_base_url: provider.api_base_url.clone(),
            http: reqwest::Client::new(),
            installation_token: None,
            user_token: None,
        }
    }

    /// The short-lived installation token, when installation-authenticated.
    /// Used to rewrite private clone URLs.
    pub fn installation_token(&self) -> Option<&str> {
        self.installation_token.as_deref()
    }

    /// Authenticate as an app installation: sign a JWT, exchange it for an
    /// installation access token.
    pub async fn for_installation(
        provider: &ProviderConfig,
        installation_id: i64,
    ) -> Result<ProviderClient> {
        let jwt = create_app_jwt(provider)?;
        let http = reqwest::Client::new();

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            provider.api_base_url, installation_id
        );
        let response = http
            .post(&url)
            .header("Accept", ACCEPT_HEADER)
            .header("Authorization", format!("Bearer {}", jwt))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| "installation token response was not JSON")?;

        let token = body.get("token").and_then(|t| t.as_str());
        let token = match token {
            Some(t) => t.to_string(),
            None => bail!(
                "could not get access token for installation {} ({}): {}",
                installation_id,
                status,
                body
            ),
        };

        Ok(ProviderClient {
            api_base_url: provider.api_base_url.clone(),
            http,
            installation_token: Some(token),
            user_token: None,
        })
    }

    /// Authenticate as a user: exchange an OAuth `code` + `state` at the
    /// provider's token endpoint.
    pub async fn for_user(
        provider: &ProviderConfig,
        code: &str,
        state: &str,
    ) -> Result<ProviderClient> {
        let client_id = provider
            .client_id
            .as_deref()
            .context("provider.client_id is not configured")?;
        let client_secret = provider
            .client_secret
            .as_deref()
            .context("provider.client_secret is not configured")?;

        let http = reqwest::Client::new();
        let response = http
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("code", code),
                ("state", state),
            ])
            .send()
            .await
            .with_context(|| format!("POST {} failed", provider.token_url))?;

        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| "user token response was not JSON")?;

        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .with_context(|| format!("no access_token in token response: {}", body))?;

        Ok(ProviderClient {
            api_base_url: provider.api_base_url.clone(),
            http,
            installation_token: None,
            user_token: Some(token.to_string()),
        })
    }

    fn auth_header(&self) -> Option<String> {
        self.installation_token
            .as_deref()
            .or(self.user_token.as_deref())
            .map(|t| format!("token {}", t))
    }

    /// Issues for a repository, oldest first. Items carrying a
    /// `pull_request` field are the provider's PR mirror rows and are kept;
    /// the ingester skips them.
    pub async fn get_issues(
        &self,
        repo_owner: &str,
        repo_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut url = format!(
            "{}/repos/{}/{}/issues?state=all&sort=created&direction=asc&per_page={}",
            self.api_base_url, repo_owner, repo_name, ITEMS_PER_PAGE
        );
        if let Some(start) = since {
            url.push_str(&format!("&since={}", start.to_rfc3339()));
        }
        self.fetch_paginated(url).await
    }

    /// Closed pull requests, most recently updated first.
    pub async fn get_pull_requests(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/repos/{}/{}/pulls?state=closed&sort=updated&direction=desc&per_page={}",
            self.api_base_url, repo_owner, repo_name, ITEMS_PER_PAGE
        );
        self.fetch_paginated(url).await
    }

    /// Published releases.
    pub async fn get_releases(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/repos/{}/{}/releases?per_page={}",
            self.api_base_url, repo_owner, repo_name, ITEMS_PER_PAGE
        );
        self.fetch_paginated(url).await
    }

    /// Follow a list endpoint's `Link: rel="next"` chain, retrying
    /// transient failures with capped exponential backoff. Exhausting the
    /// retry budget ends the iteration with the pages fetched so far.
    async fn fetch_paginated(&self, start_url: String) -> Result<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        let mut url = Some(start_url);
        let mut retries: u32 = 0;

        while let Some(current) = url.clone() {
            let mut request = self.http.get(&current).header("Accept", ACCEPT_HEADER);
            if let Some(auth) = self.auth_header() {
                request = request.header("Authorization", auth);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(err) => {
                    if retries >= MAX_RETRIES {
                        log::warn!(
                            "giving up on {} after {} attempts: {}",
                            current,
                            retries,
                            err
                        );
                        break;
                    }
                    tokio::time::sleep(backoff_delay(retries)).await;
                    retries += 1;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                if is_permanent(status.as_u16()) {
                    return Err(ProviderError::Permanent {
                        status: status.as_u16(),
                        url: current,
                    }
                    .into());
                }
                if retries >= MAX_RETRIES {
                    log::warn!(
                        "giving up on {} after {} attempts (last status {})",
                        current,
                        retries,
                        status
                    );
                    break;
                }
                tokio::time::sleep(backoff_delay(retries)).await;
                retries += 1;
                continue;
            }

            let next = response
                .headers()
                .get("Link")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);

            let page: Vec<serde_json::Value> = response
                .json()
                .await
                .with_context(|| format!("response from {} was not a JSON array", current))?;
            items.extend(page);

            url = next;
            retries = 0;
        }

        Ok(items)
    }
}

fn is_permanent(status: u16) -> bool {
    matches!(status, 401 | 404 | 410)
}

/// Delay before retry `attempt` (0-based): 1s, 2s, 4s, ... capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << attempt.min(31))
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// Extract the `rel="next"` target from a `Link` header value.
fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut segments = part.split(';');
        let url_segment = segments.next()?.trim();
        let is_next = segments
            .any(|s| s.trim() == "rel=\"next\"" || s.trim() == "rel=next");
        if is_next {
            let url = url_segment
                .strip_prefix('<')
                .and_then(|s| s.strip_suffix('>'))?;
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_parsed_from_multi_link_header() {
        let header = "<https://api.example.com/repos/a/b/issues?page=2>; rel=\"next\", \
                      <https://api.example.com/repos/a/b/issues?page=5>; rel=\"last\"";
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example.com/repos/a/b/issues?page=2")
        );
    }

    #[test]
    fn no_next_link_on_last_page() {
        let header = "<https://api.example.com/repos/a/b/issues?page=1>; rel=\"first\", \
                      <https://api.example.com/repos/a/b/issues?page=4>; rel=\"prev\"";
        assert_eq!(parse_next_link(header), None);
    }

    #[test]
    fn missing_header_means_single_page() {
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn permanent_statuses() {
        assert!(is_permanent(404));
        assert!(is_permanent(401));
        assert!(!is_permanent(500));
        assert!(!is_permanent(429));
    }
}
