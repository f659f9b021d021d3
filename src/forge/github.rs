//! GitHub / GitHub Enterprise identity provider.
//!
//! Talks to the REST API with the caller's own token: `GET /user` for the
//! profile, `GET /orgs/{org}/members/{login}` for membership and a paginated
//! `GET /user/teams` for the roster.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;

use super::rate_limit::{self, RateLimitState};
use super::{IdentityProvider, ProviderError, Team, UserProfile};

const ACCEPT_GITHUB: &str = "application/vnd.github+json";
const TEAMS_PER_PAGE: &str = "100";
/// Upper bound on `/user/teams` pages followed for one token.
const MAX_TEAM_PAGES: usize = 50;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TeamResponse {
    slug: String,
    organization: OrganizationResponse,
}

#[derive(Debug, Deserialize)]
struct OrganizationResponse {
    login: String,
}

impl From<TeamResponse> for Team {
    fn from(team: TeamResponse) -> Self {
        Team::new(team.slug, team.organization.login)
    }
}

// ---------------------------------------------------------------------------
// Provider struct
// ---------------------------------------------------------------------------

pub struct GitHubProvider {
    http: reqwest::Client,
    api_url: Url,
    rate_limit: RateLimitState,
    metrics: Option<Arc<Metrics>>,
}

impl GitHubProvider {
    pub fn new(
        config: &Config,
        rate_limit: RateLimitState,
        metrics: Option<Arc<Metrics>>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.upstream.user_agent)
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(http, &config.upstream.api_url, rate_limit, metrics)
    }

    pub fn with_client(
        http: reqwest::Client,
        api_url: &str,
        rate_limit: RateLimitState,
        metrics: Option<Arc<Metrics>>,
    ) -> anyhow::Result<Self> {
        let api_url = Url::parse(api_url.trim_end_matches('/'))
            .with_context(|| format!("invalid GitHub API URL: {api_url}"))?;
        anyhow::ensure!(
            !api_url.cannot_be_a_base(),
            "GitHub API URL cannot be a base: {api_url}"
        );
        Ok(Self {
            http,
            api_url,
            rate_limit,
            metrics,
        })
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// Append percent-encoded `segments` to the API base path.
    fn endpoint_url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API URL cannot be a base: {}", self.api_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send an authenticated GET, record it, and fail fast on an exhausted
    /// rate limit.  Every other status is left to the caller.
    async fn get(&self, endpoint: &'static str, url: Url, token: &str) -> Result<Response, ProviderError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_call(endpoint);
        }
        debug!(endpoint, url = %url, "calling GitHub API");

        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, ACCEPT_GITHUB)
            .send()
            .await
            .map_err(|e| {
                error!(endpoint, error = %e, "GitHub API request failed");
                anyhow::Error::new(e).context(format!("{endpoint}: request failed"))
            })?;

        self.rate_limit.update_from_headers(resp.headers());

        if rate_limit::is_exhausted(resp.status(), resp.headers()) {
            warn!(
                endpoint,
                status = %resp.status(),
                retry_after_secs = ?self.rate_limit.retry_after_secs(),
                "rate limited by GitHub API"
            );
            return Err(ProviderError::RateLimited);
        }

        Ok(resp)
    }

    async fn fetch_teams_page(&self, token: &str, url: Url) -> Result<(Vec<Team>, Option<Url>), ProviderError> {
        let resp = self.get("list_user_teams", url, token).await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(endpoint = "list_user_teams", "token rejected by GitHub");
                return Err(ProviderError::Unauthorized);
            }
            status if !status.is_success() => return Err(unexpected("list_user_teams", resp).await),
            _ => {}
        }

        let next = next_page_url(resp.headers())?;
        let teams: Vec<TeamResponse> = resp
            .json()
            .await
            .context("list_user_teams: failed to decode response")?;

        Ok((teams.into_iter().map(Team::from).collect(), next))
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl IdentityProvider for GitHubProvider {
    async fn who_am_i(&self, token: &str) -> Result<(UserProfile, bool), ProviderError> {
        let url = self.endpoint_url(&["user"])?;
        let resp = self.get("get_user", url, token).await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(endpoint = "get_user", "token rejected by GitHub");
                return Err(ProviderError::Unauthorized);
            }
            status if !status.is_success() => return Err(unexpected("get_user", resp).await),
            _ => {}
        }

        // Only classic PATs carry X-OAuth-Scopes.
        let is_classic_pat = resp
            .headers()
            .get("X-OAuth-Scopes")
            .is_some_and(|v| !v.as_bytes().is_empty());

        let user: UserProfile = resp
            .json()
            .await
            .context("get_user: failed to decode response")?;

        info!(login = %user.login, id = user.id, is_classic_pat, "fetched GitHub user");
        Ok((user, is_classic_pat))
    }

    async fn check_membership(&self, token: &str, org: &str, login: &str) -> Result<(), ProviderError> {
        let url = self.endpoint_url(&["orgs", org, "members", login])?;
        let resp = self.get("check_org_membership", url, token).await?;

        match resp.status() {
            StatusCode::NO_CONTENT => {
                debug!(org, login, "user is an organization member");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                warn!(org, login, "user is not an organization member");
                Err(ProviderError::NotMember)
            }
            StatusCode::UNAUTHORIZED => {
                warn!(endpoint = "check_org_membership", "token rejected by GitHub");
                Err(ProviderError::Unauthorized)
            }
            _ => Err(unexpected("check_org_membership", resp).await),
        }
    }

    async fn list_groups(&self, token: &str, org: &str) -> Result<Vec<Team>, ProviderError> {
        let mut url = self.endpoint_url(&["user", "teams"])?;
        url.query_pairs_mut().append_pair("per_page", TEAMS_PER_PAGE);

        let mut teams = Vec::new();
        let mut next = Some(url);
        let mut pages = 0usize;
        while let Some(url) = next.take() {
            if pages == MAX_TEAM_PAGES {
                error!(org, pages, "team listing exceeded page limit");
                return Err(anyhow!("list_user_teams: more than {MAX_TEAM_PAGES} pages").into());
            }
            if url.origin() != self.api_url.origin() {
                error!(org, next = %url, "refusing to follow team page link to another origin");
                return Err(anyhow!("list_user_teams: next page {url} is outside {}", self.api_url).into());
            }
            let (page, following) = self.fetch_teams_page(token, url).await?;
            teams.extend(page);
            next = following;
            pages += 1;
        }

        debug!(org, pages, total_teams = teams.len(), "listed user teams");
        Ok(teams)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn unexpected(endpoint: &'static str, resp: Response) -> ProviderError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    error!(endpoint, %status, "unexpected response from GitHub API");
    ProviderError::Other(anyhow!(
        "{endpoint}: unexpected status {}: {}",
        status.as_u16(),
        body.trim()
    ))
}

fn next_page_url(headers: &HeaderMap) -> Result<Option<Url>, ProviderError> {
    let Some(link) = headers.get(LINK).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    match parse_link_next(link) {
        Some(next) => {
            let url = Url::parse(&next).with_context(|| format!("invalid next page URL: {next}"))?;
            Ok(Some(url))
        }
        None => Ok(None),
    }
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header.
pub fn parse_link_next(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        parts
            .any(|param| param.trim().eq_ignore_ascii_case("rel=\"next\""))
            .then(|| url.to_string())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
