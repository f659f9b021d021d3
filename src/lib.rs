//! Forward-auth service that authorises GitHub personal access tokens by
//! organisation membership, with an in-process result cache.

pub mod auth;
pub mod config;
pub mod forge;
pub mod health;
pub mod http;
pub mod metrics;

use std::sync::Arc;

use crate::auth::cache::ResultCache;
use crate::auth::validator::Validator;
use crate::config::Config;
use crate::forge::rate_limit::RateLimitState;
use crate::forge::IdentityProvider;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub validator: Arc<Validator>,
    /// Owned here as well as by the validator so that shutdown can stop the
    /// sweeper and health checks can inspect it.
    pub cache: Arc<ResultCache>,
    pub metrics: MetricsRegistry,
    pub rate_limit: RateLimitState,
}

impl AppState {
    /// Wire the cache and validator for `config` around `provider`.
    ///
    /// Must be called from within a Tokio runtime when caching is enabled.
    pub fn build(
        config: Config,
        provider: Arc<dyn IdentityProvider>,
        rate_limit: RateLimitState,
        metrics: MetricsRegistry,
    ) -> Self {
        let cache = Arc::new(ResultCache::with_metrics(
            config.cache.ttl(),
            config.cache.max_size,
            metrics.metrics.cache.clone(),
        ));
        let validator = Validator::new(
            provider,
            cache.clone(),
            config.org.clone(),
            config.auth.reject_classic_pats,
        )
        .with_metrics(Arc::clone(&metrics.metrics));

        Self {
            config: Arc::new(config),
            validator: Arc::new(validator),
            cache,
            metrics,
            rate_limit,
        }
    }
}
