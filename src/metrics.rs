use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Cache metrics
// ---------------------------------------------------------------------------

/// Counters and gauge owned by a [`crate::auth::cache::ResultCache`].
///
/// The default value is a set of unregistered metrics, which is what the cache
/// uses when no registry is wired in (tests, embedding).
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    pub hits: Counter,
    pub misses: Counter,
    pub evictions: Counter,
    /// Always equal to the cache's entry count after a mutation.
    pub entries: Gauge,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- result cache --
    pub cache: CacheMetrics,

    // -- validation --
    pub validation_total: Family<ResultLabels, Counter>,

    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache = CacheMetrics::default();
        registry.register(
            "forgeauth_cache_hits",
            "Token cache hits",
            cache.hits.clone(),
        );
        registry.register(
            "forgeauth_cache_misses",
            "Token cache misses, including expired entries",
            cache.misses.clone(),
        );
        registry.register(
            "forgeauth_cache_evictions",
            "Token cache entries evicted to respect max_size",
            cache.evictions.clone(),
        );
        registry.register(
            "forgeauth_cache_entries",
            "Current number of token cache entries",
            cache.entries.clone(),
        );

        let validation_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "forgeauth_validation",
            "Token validations by result",
            validation_total.clone(),
        );

        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgeauth_upstream_api_calls",
            "Upstream API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "forgeauth_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        Self {
            cache,
            validation_total,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
        }
    }

    pub fn record_validation(&self, result: &str) {
        self.validation_total
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_upstream_call(&self, endpoint: &str) {
        self.upstream_api_calls
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared through `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
