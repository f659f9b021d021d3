//! Identity provider abstraction layer.
//!
//! The validator resolves a bearer token to a user, an organisation
//! membership and a team roster through the [`IdentityProvider`] trait.  No
//! forge-specific URL construction or response parsing leaks outside this
//! module.

pub mod github;
pub mod rate_limit;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::metrics::Metrics;

use self::rate_limit::RateLimitState;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// The authenticated user as reported by the forge.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct UserProfile {
    pub login: String,
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
}

/// A team the user belongs to, with the login of the owning organisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub slug: String,
    pub org: String,
}

impl Team {
    pub fn new(slug: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            org: org.into(),
        }
    }
}

/// Failures an [`IdentityProvider`] can report.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("token rejected by upstream")]
    Unauthorized,
    #[error("user is not a member of the organization")]
    NotMember,
    #[error("upstream API rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the forge API calls needed to authorise a token.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the token's owner.  The flag is `true` for classic
    /// (non fine-grained) personal access tokens.
    async fn who_am_i(&self, token: &str) -> Result<(UserProfile, bool), ProviderError>;

    /// Succeeds iff `login` is a member of `org`.
    async fn check_membership(&self, token: &str, org: &str, login: &str)
        -> Result<(), ProviderError>;

    /// Every team visible to the token.  Callers filter by organisation.
    async fn list_groups(&self, token: &str, org: &str) -> Result<Vec<Team>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured [`IdentityProvider`].
pub fn build_provider(
    config: &Config,
    rate_limit: RateLimitState,
    metrics: Option<Arc<Metrics>>,
) -> Result<Arc<dyn IdentityProvider>> {
    let provider = github::GitHubProvider::new(config, rate_limit, metrics)?;
    Ok(Arc::new(provider))
}
