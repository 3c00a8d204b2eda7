//! Transparent caching reverse proxy for the git smart-HTTP protocol.
//!
//! Clients rewrite their remotes through this proxy with
//! `git config url.<proxy>/https://host/.insteadOf https://host/`; the proxy
//! keeps one bare mirror per upstream repository under the cache root,
//! refreshes mirrors on demand, and serves `info/refs` and
//! `git-upload-pack` directly from local disk. The mirror store is bounded
//! by an LRU eviction policy sized in bytes or as a percentage of free disk.

pub mod config;
pub mod coordination;
pub mod error;
pub mod fingerprint;
pub mod git;
pub mod health;
pub mod http;
pub mod metrics;
pub mod mirror;
pub mod sync;
pub mod upstream;

use std::sync::Arc;

use crate::config::Config;
use crate::coordination::leases::LeaseTable;
use crate::metrics::MetricsRegistry;
use crate::mirror::cache::MirrorCache;
use crate::mirror::store::MirrorStore;
use crate::sync::Synchronizer;
use crate::upstream::Upstream;

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MirrorStore>,
    pub cache: Arc<MirrorCache>,
    pub leases: Arc<LeaseTable>,
    pub sync: Arc<Synchronizer>,
    pub metrics: MetricsRegistry,
}

/// Wire up every component from a validated [`Config`].
pub fn build_state(config: Config) -> AppState {
    let config = Arc::new(config);
    let metrics = MetricsRegistry::new();
    let store = Arc::new(MirrorStore::new(config.cache_root.clone()));
    let leases = Arc::new(LeaseTable::new());
    let cache = Arc::new(MirrorCache::new(
        Arc::clone(&store),
        Arc::clone(&leases),
        config.cache_size,
        metrics.clone(),
    ));
    let upstream = Upstream::from_config(&config);
    let sync = Arc::new(Synchronizer::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&leases),
        upstream,
        config.max_concurrent_syncs,
        metrics.clone(),
    ));

    AppState {
        config,
        store,
        cache,
        leases,
        sync,
        metrics,
    }
}
