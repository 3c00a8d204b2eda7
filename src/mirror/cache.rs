//! LRU eviction over the mirror store.
//!
//! The cache manager tracks last-access times in memory and, after every
//! mirror-creating write, checks disk usage against the configured budget.
//! When over budget it deletes mirrors in ascending access-time order until
//! usage drops to the hysteresis target. Mirrors with live leases are
//! skipped for the current sweep; on a cold start access times fall back to
//! filesystem mtimes.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use nix::sys::statvfs::statvfs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::size::{format_size, SizeSpec};
use crate::coordination::leases::LeaseTable;
use crate::metrics::MetricsRegistry;
use crate::mirror::store::{dir_size, MirrorStore};

/// Default share of free disk used when no cache size is configured.
const DEFAULT_MAX_PERCENT: f64 = 80.0;
/// Free space always left untouched on the cache filesystem (1 GiB).
const MIN_FREE_BYTES: u64 = 1 << 30;
/// Eviction drains usage to this fraction of the budget.
const HYSTERESIS: f64 = 0.90;

pub struct MirrorCache {
    store: Arc<MirrorStore>,
    leases: Arc<LeaseTable>,
    max_size: Option<SizeSpec>,
    metrics: MetricsRegistry,
    access: DashMap<String, SystemTime>,
    sweep: Mutex<()>,
}

impl MirrorCache {
    pub fn new(
        store: Arc<MirrorStore>,
        leases: Arc<LeaseTable>,
        max_size: Option<SizeSpec>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            leases,
            max_size,
            metrics,
            access: DashMap::new(),
            sweep: Mutex::new(()),
        }
    }

    /// Record an access for a fingerprint. O(1).
    pub fn touch(&self, key: &str) {
        self.access.insert(key.to_string(), SystemTime::now());
    }

    /// Check usage against the budget and evict least-recently-used mirrors
    /// if it is exceeded. Called after each successful clone; all failures
    /// are soft.
    pub async fn maybe_evict(&self) {
        let _sweep = self.sweep.lock().await;

        let Some(budget) = self.budget() else {
            return;
        };
        if budget == 0 {
            debug!("no usable cache budget; skipping eviction");
            return;
        }

        let root = self.store.root().to_path_buf();
        let usage = match tokio::task::spawn_blocking(move || dir_size(&root)).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "mirror usage walk failed");
                return;
            }
        };

        if usage <= budget {
            debug!(
                usage = %format_size(usage),
                budget = %format_size(budget),
                "cache within budget"
            );
            self.metrics.metrics.cache_size_bytes.set(usage as i64);
            return;
        }

        info!(
            usage = %format_size(usage),
            budget = %format_size(budget),
            "cache over budget; starting eviction sweep"
        );

        let store = Arc::clone(&self.store);
        let entries = match tokio::task::spawn_blocking(move || store.list()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "mirror listing failed");
                return;
            }
        };
        let total_mirrors = entries.len();

        // Rank by last access, oldest first; the in-memory index wins over
        // filesystem mtimes. Ties break on path so the order is total.
        let mut ranked: Vec<(SystemTime, _)> = entries
            .into_iter()
            .map(|entry| {
                let last_access = self
                    .access
                    .get(entry.fingerprint.as_str())
                    .map(|at| *at)
                    .unwrap_or(entry.modified);
                (last_access, entry)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));

        let target = (budget as f64 * HYSTERESIS) as u64;
        let mut usage = usage;
        let mut evicted: usize = 0;

        for (last_access, entry) in ranked {
            if usage <= target {
                break;
            }
            let key = entry.fingerprint.as_str();

            let Some(_lease) = self.leases.try_write(key) else {
                debug!(repo = %key, "mirror busy; skipping this sweep");
                continue;
            };

            let size_path = entry.path.clone();
            let size = match tokio::task::spawn_blocking(move || dir_size(&size_path)).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(repo = %key, error = %e, "failed to size mirror");
                    continue;
                }
            };

            info!(
                repo = %key,
                size = %format_size(size),
                ?last_access,
                "evicting mirror"
            );
            if let Err(e) = self.store.delete(&entry.fingerprint).await {
                warn!(repo = %key, error = %e, "failed to evict mirror");
                continue;
            }

            usage = usage.saturating_sub(size);
            self.access.remove(key);
            self.leases.forget(key);
            evicted += 1;
            self.metrics.metrics.evictions.inc();
            self.metrics.metrics.evicted_bytes.inc_by(size);
        }

        info!(evicted, usage = %format_size(usage), "eviction sweep finished");
        self.metrics.metrics.cache_size_bytes.set(usage as i64);
        self.metrics
            .metrics
            .cache_repos_total
            .set((total_mirrors - evicted) as i64);
    }

    /// Byte budget for the store, derived from free disk space.
    fn budget(&self) -> Option<u64> {
        let stat = match statvfs(self.store.root()) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(error = %e, "statvfs failed on cache root");
                return None;
            }
        };
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Some(compute_budget(available, self.max_size))
    }
}

/// Resolve a size specification against the currently available disk bytes:
/// absolute sizes pass through, percentages apply to `available`, unset
/// selects the default share. The result always leaves [`MIN_FREE_BYTES`]
/// of headroom on the device.
pub(crate) fn compute_budget(available: u64, spec: Option<SizeSpec>) -> u64 {
    let raw = match spec {
        Some(SizeSpec::Absolute(bytes)) => bytes,
        Some(SizeSpec::Percent(pct)) => (available as f64 * pct / 100.0) as u64,
        None => (available as f64 * DEFAULT_MAX_PERCENT / 100.0) as u64,
    };
    if available.saturating_sub(raw) < MIN_FREE_BYTES {
        available.saturating_sub(MIN_FREE_BYTES)
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};

    use crate::fingerprint::Fingerprint;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn budget_respects_absolute_and_percent_specs() {
        let avail = 100 * (1 << 30) as u64;
        assert_eq!(
            compute_budget(avail, Some(SizeSpec::Absolute(10 * MIB))),
            10 * MIB,
        );
        assert_eq!(
            compute_budget(avail, Some(SizeSpec::Percent(50.0))),
            avail / 2,
        );
        assert_eq!(
            compute_budget(avail, None),
            (avail as f64 * 0.80) as u64,
        );
    }

    #[test]
    fn budget_always_leaves_the_free_reserve() {
        // A - B >= min(R, A) for any combination.
        let reserve = MIN_FREE_BYTES;
        for avail in [0, reserve / 2, reserve, 4 * reserve, 100 * reserve] {
            for spec in [
                None,
                Some(SizeSpec::Percent(100.0)),
                Some(SizeSpec::Absolute(avail)),
                Some(SizeSpec::Absolute(avail * 2)),
            ] {
                let budget = compute_budget(avail, spec);
                assert!(
                    avail - budget >= reserve.min(avail),
                    "avail={avail} spec={spec:?} budget={budget}",
                );
            }
        }
    }

    fn set_head_mtime(root: &Path, fingerprint: &str, mtime: std::time::SystemTime) {
        let head = root.join(format!("{fingerprint}.git/HEAD"));
        let file = fs::File::options().write(true).open(head).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn seed_mirror(root: &Path, fingerprint: &str, data_len: usize) {
        let path = root.join(format!("{fingerprint}.git"));
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(path.join("pack"), vec![0u8; data_len]).unwrap();
    }

    fn test_cache(root: &Path, spec: SizeSpec) -> (MirrorCache, Arc<MirrorStore>) {
        let store = Arc::new(MirrorStore::new(root));
        let leases = Arc::new(LeaseTable::new());
        let cache = MirrorCache::new(
            Arc::clone(&store),
            leases,
            Some(spec),
            MetricsRegistry::new(),
        );
        (cache, store)
    }

    #[tokio::test]
    async fn evicts_oldest_mirrors_until_under_hysteresis_target() {
        let tmp = tempfile::tempdir().unwrap();
        // Twelve mirrors of just under 1 MiB against a 10 MiB budget: the
        // three least recently used must go (9 * ~1 MiB <= 9 MiB target).
        let data_len = (MIB - 1024) as usize;
        let (cache, store) = test_cache(tmp.path(), SizeSpec::Absolute(10 * MIB));

        for i in 0..12 {
            let key = format!("example.com/acme/repo{i:02}");
            seed_mirror(tmp.path(), &key, data_len);
            cache
                .access
                .insert(key, UNIX_EPOCH + Duration::from_secs(1_000 + i));
        }

        cache.maybe_evict().await;

        let mut remaining: Vec<String> = store
            .list()
            .into_iter()
            .map(|entry| entry.fingerprint.as_str().to_string())
            .collect();
        remaining.sort();
        let expected: Vec<String> = (3..12)
            .map(|i| format!("example.com/acme/repo{i:02}"))
            .collect();
        assert_eq!(remaining, expected);

        for key in &remaining {
            let fp = Fingerprint::parse(key).unwrap();
            assert!(store.exists(&fp), "{key} lost its HEAD");
        }
    }

    #[tokio::test]
    async fn eviction_skips_mirrors_with_live_leases() {
        let tmp = tempfile::tempdir().unwrap();
        let data_len = (MIB - 1024) as usize;
        let store = Arc::new(MirrorStore::new(tmp.path()));
        let leases = Arc::new(LeaseTable::new());
        let cache = MirrorCache::new(
            Arc::clone(&store),
            Arc::clone(&leases),
            Some(SizeSpec::Absolute(3 * MIB)),
            MetricsRegistry::new(),
        );

        for i in 0..4 {
            let key = format!("example.com/acme/repo{i}");
            seed_mirror(tmp.path(), &key, data_len);
            cache
                .access
                .insert(key, UNIX_EPOCH + Duration::from_secs(1_000 + i));
        }

        // The oldest mirror is being read; the sweep must pass over it.
        let busy = leases.read("example.com/acme/repo0").await;
        cache.maybe_evict().await;
        drop(busy);

        let remaining: Vec<String> = store
            .list()
            .into_iter()
            .map(|entry| entry.fingerprint.as_str().to_string())
            .collect();
        assert!(remaining.contains(&"example.com/acme/repo0".to_string()));
        assert!(!remaining.contains(&"example.com/acme/repo1".to_string()));
    }

    #[tokio::test]
    async fn no_eviction_when_within_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, store) = test_cache(tmp.path(), SizeSpec::Absolute(100 * MIB));
        seed_mirror(tmp.path(), "example.com/acme/widgets", MIB as usize);
        cache.touch("example.com/acme/widgets");

        cache.maybe_evict().await;
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn cold_start_falls_back_to_filesystem_mtimes() {
        let tmp = tempfile::tempdir().unwrap();
        let data_len = (MIB - 1024) as usize;
        let (cache, store) = test_cache(tmp.path(), SizeSpec::Absolute(2 * MIB));

        seed_mirror(tmp.path(), "example.com/acme/old", data_len);
        // Push the old mirror's HEAD mtime into the past.
        let past = std::time::SystemTime::now() - Duration::from_secs(3600);
        set_head_mtime(tmp.path(), "example.com/acme/old", past);

        seed_mirror(tmp.path(), "example.com/acme/new", data_len);
        seed_mirror(tmp.path(), "example.com/acme/mid", data_len);
        set_head_mtime(
            tmp.path(),
            "example.com/acme/mid",
            past + Duration::from_secs(600),
        );

        // No in-memory access entries at all: pure mtime ordering.
        cache.maybe_evict().await;

        let remaining: Vec<String> = store
            .list()
            .into_iter()
            .map(|entry| entry.fingerprint.as_str().to_string())
            .collect();
        assert!(!remaining.contains(&"example.com/acme/old".to_string()));
        assert!(remaining.contains(&"example.com/acme/new".to_string()));
    }
}
