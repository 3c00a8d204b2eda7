use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub repo: String,
    pub endpoint: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RepoLabels {
    pub repo: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub op: SyncOp,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncOp {
    Clone,
    Fetch,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<EndpointLabels, Histogram>,
    pub response_bytes: Histogram,

    // -- cache --
    pub cache_hits: Family<RepoLabels, Counter>,
    pub cache_misses: Family<RepoLabels, Counter>,
    pub cache_size_bytes: Gauge,
    pub cache_repos_total: Gauge,

    // -- upstream --
    pub upstream_sync_total: Family<SyncLabels, Counter>,
    pub sync_soft_failures: Counter,

    // -- eviction --
    pub evictions: Counter,
    pub evicted_bytes: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "mirrorcache_requests",
            "Git requests by repository, endpoint and outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "mirrorcache_request_duration_seconds",
            "Git request latency in seconds",
            request_duration_seconds.clone(),
        );

        let response_bytes = Histogram::new(exponential_buckets(1024.0, 4.0, 12));
        registry.register(
            "mirrorcache_response_bytes",
            "Response body size in bytes",
            response_bytes.clone(),
        );

        let cache_hits = Family::<RepoLabels, Counter>::default();
        registry.register(
            "mirrorcache_cache_hits",
            "Requests served without upstream network I/O",
            cache_hits.clone(),
        );

        let cache_misses = Family::<RepoLabels, Counter>::default();
        registry.register(
            "mirrorcache_cache_misses",
            "Requests that required upstream network I/O",
            cache_misses.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "mirrorcache_cache_size_bytes",
            "Mirror store disk usage in bytes as of the last sweep",
            cache_size_bytes.clone(),
        );

        let cache_repos_total: Gauge = Gauge::default();
        registry.register(
            "mirrorcache_cache_repos",
            "Number of mirrors on disk as of the last sweep",
            cache_repos_total.clone(),
        );

        let upstream_sync_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "mirrorcache_upstream_sync",
            "Upstream clone/fetch operations by outcome",
            upstream_sync_total.clone(),
        );

        let sync_soft_failures = Counter::default();
        registry.register(
            "mirrorcache_sync_soft_failures",
            "Refresh failures absorbed by serving the stale mirror",
            sync_soft_failures.clone(),
        );

        let evictions = Counter::default();
        registry.register(
            "mirrorcache_evictions",
            "Mirrors removed by the LRU sweep",
            evictions.clone(),
        );

        let evicted_bytes = Counter::default();
        registry.register(
            "mirrorcache_evicted_bytes",
            "Bytes reclaimed by the LRU sweep",
            evicted_bytes.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            response_bytes,
            cache_hits,
            cache_misses,
            cache_size_bytes,
            cache_repos_total,
            upstream_sync_total,
            sync_soft_failures,
            evictions,
            evicted_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
