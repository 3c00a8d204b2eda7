//! On-demand upstream synchronization of mirrors.
//!
//! `ensure_fresh` is the single entry point: it decides from the refresh
//! policy whether a request needs upstream traffic, coalesces concurrent
//! synchronizations for the same fingerprint through the flight group, and
//! performs the actual clone or fetch under the mirror's exclusive lease.
//! First-time failures are hard errors; refresh failures are soft and the
//! stale mirror is served.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::AuthMode;
use crate::coordination::flight::FlightGroup;
use crate::coordination::leases::{LeaseTable, ReadLease};
use crate::error::ProxyError;
use crate::fingerprint::{Fingerprint, Scheme};
use crate::git::commands::{self, GitError, GitOptions};
use crate::metrics::{MetricsRegistry, SyncLabels, SyncOp};
use crate::mirror::cache::MirrorCache;
use crate::mirror::store::MirrorStore;
use crate::upstream::Upstream;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// When a mirror must be brought up to date before serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Synchronize only when the mirror does not exist yet.
    OnMiss,
    /// Synchronize unconditionally.
    Always,
    /// Synchronize for ref-advertisement requests, so `ls-remote` and the
    /// first phase of clone/fetch always see current refs.
    InfoRefs,
}

/// What `ensure_fresh` did for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Mirror created by a first-time clone.
    Cloned,
    /// Existing mirror refreshed from upstream.
    Fetched,
    /// Mirror already present; no upstream traffic.
    Hit,
    /// Refresh failed; the stale mirror will be served.
    Stale,
}

impl SyncOutcome {
    /// True when the outcome involved (or attempted) upstream network I/O.
    pub fn performed_network(&self) -> bool {
        !matches!(self, SyncOutcome::Hit)
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct Synchronizer {
    store: Arc<MirrorStore>,
    cache: Arc<MirrorCache>,
    leases: Arc<LeaseTable>,
    upstream: Upstream,
    flights: FlightGroup,
    permits: Arc<Semaphore>,
    metrics: MetricsRegistry,
    tmp_seq: AtomicU64,
}

impl Synchronizer {
    pub fn new(
        store: Arc<MirrorStore>,
        cache: Arc<MirrorCache>,
        leases: Arc<LeaseTable>,
        upstream: Upstream,
        max_concurrent: usize,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            cache,
            leases,
            upstream,
            flights: FlightGroup::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            metrics,
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Ensure the mirror for `fingerprint` is present and fresh enough for
    /// the given policy. Concurrent calls for the same fingerprint share
    /// one underlying synchronization.
    ///
    /// Returns the outcome together with a shared read lease on the mirror,
    /// with the access index already touched. Handing the lease back (rather
    /// than letting the caller acquire its own) means there is no window
    /// between synchronization and serving in which an eviction sweep could
    /// take the exclusive slot and delete the mirror.
    #[instrument(skip_all, fields(repo = %fingerprint, policy = ?policy))]
    pub async fn ensure_fresh(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        scheme: Scheme,
        policy: RefreshPolicy,
        authorization: Option<String>,
    ) -> Result<(SyncOutcome, ReadLease), ProxyError> {
        if policy == RefreshPolicy::OnMiss {
            // Eviction needs the exclusive slot, so once the read lease is
            // held an existing mirror cannot vanish underneath us.
            let lease = self.leases.read(fingerprint.as_str()).await;
            if self.store.exists(fingerprint) {
                debug!("mirror present; no synchronization needed");
                self.cache.touch(fingerprint.as_str());
                return Ok((SyncOutcome::Hit, lease));
            }
            drop(lease);
        }

        let mut outcome = self
            .run_flight(fingerprint, scheme, authorization.clone())
            .await?;

        // Re-acquire under a read lease: a sweep triggered by a concurrent
        // clone may have evicted the mirror between the flight completing
        // and this point. Synchronize again once; if the mirror is gone
        // again the budget cannot hold it at all.
        let mut retried = false;
        loop {
            let lease = self.leases.read(fingerprint.as_str()).await;
            if self.store.exists(fingerprint) {
                self.cache.touch(fingerprint.as_str());
                return Ok((outcome, lease));
            }
            drop(lease);

            if retried {
                warn!(repo = %fingerprint, "mirror evicted again right after synchronization");
                return Err(ProxyError::StorageFull(fingerprint.to_string()));
            }
            retried = true;
            debug!(repo = %fingerprint, "mirror evicted before serving; synchronizing again");
            outcome = self
                .run_flight(fingerprint, scheme, authorization.clone())
                .await?;
        }
    }

    async fn run_flight(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        scheme: Scheme,
        authorization: Option<String>,
    ) -> Result<SyncOutcome, ProxyError> {
        let this = Arc::clone(self);
        let fp = fingerprint.clone();
        self.flights
            .run(fingerprint.as_str(), async move {
                this.sync_once(fp, scheme, authorization).await
            })
            .await
    }

    async fn sync_once(
        &self,
        fingerprint: Fingerprint,
        scheme: Scheme,
        authorization: Option<String>,
    ) -> Result<SyncOutcome, ProxyError> {
        let url = self.upstream.url_for(scheme, &fingerprint)?;
        let opts = self.upstream.git_options(authorization.as_deref());

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(ProxyError::internal)?;
        let _lease = self.leases.write(fingerprint.as_str()).await;

        if self.store.exists(&fingerprint) {
            self.refresh(&fingerprint, &url, &opts).await
        } else {
            self.clone_new(&fingerprint, &url, &opts).await
        }
    }

    /// First-time synchronization: clone into a temporary sibling and move
    /// it into place atomically, so a cancelled or failed clone never leaves
    /// a partial mirror behind.
    async fn clone_new(
        &self,
        fingerprint: &Fingerprint,
        url: &str,
        opts: &GitOptions,
    ) -> Result<SyncOutcome, ProxyError> {
        let dest = self.store.resolve(fingerprint);
        let parent = dest
            .parent()
            .ok_or_else(|| ProxyError::Internal(format!("mirror path has no parent: {}", dest.display())))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to create mirror parent: {e}")))?;

        let tmp = self.temp_path(&dest, &parent);
        let cleanup = TempDirGuard::new(tmp.clone());

        info!(repo = %fingerprint, %url, "cloning new mirror");
        let result = tokio::time::timeout(
            self.upstream.timeout(),
            commands::clone_mirror(url, &tmp, opts),
        )
        .await;

        match result {
            Err(_elapsed) => {
                self.record(SyncOp::Clone, "timeout");
                warn!(repo = %fingerprint, "first-time clone timed out");
                Err(ProxyError::UpstreamTimeout(self.upstream.timeout().as_secs()))
            }
            Ok(Err(err)) => {
                let mapped = self.classify(&err, fingerprint);
                self.record(SyncOp::Clone, mapped.kind());
                warn!(repo = %fingerprint, error = %err, "first-time clone failed");
                Err(mapped)
            }
            Ok(Ok(())) => {
                tokio::fs::rename(&tmp, &dest).await.map_err(|e| {
                    ProxyError::Internal(format!("failed to move mirror into place: {e}"))
                })?;
                cleanup.disarm();
                self.record(SyncOp::Clone, "ok");
                info!(repo = %fingerprint, "mirror cloned");
                self.cache.maybe_evict().await;
                Ok(SyncOutcome::Cloned)
            }
        }
    }

    /// Refresh an existing mirror. Upstream failures are absorbed: the
    /// request proceeds against the stale mirror.
    async fn refresh(
        &self,
        fingerprint: &Fingerprint,
        url: &str,
        opts: &GitOptions,
    ) -> Result<SyncOutcome, ProxyError> {
        let path = self.store.resolve(fingerprint);
        debug!(repo = %fingerprint, "refreshing mirror");

        let result = tokio::time::timeout(
            self.upstream.timeout(),
            commands::fetch_all(&path, url, opts),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.record(SyncOp::Fetch, "ok");
                Ok(SyncOutcome::Fetched)
            }
            Ok(Err(err)) => {
                self.record(SyncOp::Fetch, "error");
                self.metrics.metrics.sync_soft_failures.inc();
                warn!(repo = %fingerprint, error = %err, "refresh failed; serving stale mirror");
                Ok(SyncOutcome::Stale)
            }
            Err(_elapsed) => {
                self.record(SyncOp::Fetch, "timeout");
                self.metrics.metrics.sync_soft_failures.inc();
                warn!(repo = %fingerprint, "refresh timed out; serving stale mirror");
                Ok(SyncOutcome::Stale)
            }
        }
    }

    /// Map a failed upstream git invocation onto the error taxonomy. A
    /// private repository looks like an auth failure to git; without
    /// credential passthrough that is indistinguishable from a missing
    /// repository, so it maps to not-found.
    fn classify(&self, err: &GitError, fingerprint: &Fingerprint) -> ProxyError {
        let stderr = err.stderr().to_lowercase();
        let passthrough = self.upstream.auth_mode() == AuthMode::Passthrough;

        if stderr.contains("no space left") {
            return ProxyError::StorageFull(fingerprint.to_string());
        }
        if stderr.contains("not found") || stderr.contains("error: 404") {
            return ProxyError::NotFound(fingerprint.to_string());
        }
        if stderr.contains("authentication failed")
            || stderr.contains("could not read username")
            || stderr.contains("error: 401")
            || stderr.contains("error: 403")
        {
            return if passthrough {
                ProxyError::Unauthorized(fingerprint.to_string())
            } else {
                ProxyError::NotFound(fingerprint.to_string())
            };
        }
        ProxyError::UpstreamUnavailable(err.to_string())
    }

    fn record(&self, op: SyncOp, outcome: &str) {
        self.metrics
            .metrics
            .upstream_sync_total
            .get_or_create(&SyncLabels {
                op,
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Temporary clone destination next to the final path. The name never
    /// ends in `.git`, so a half-written clone is invisible to the store.
    fn temp_path(&self, dest: &Path, parent: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mirror.git".to_string());
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        parent.join(format!(".tmp-{name}.{}.{seq}", std::process::id()))
    }
}

/// Removes the temporary clone directory unless disarmed. Runs on every
/// exit path, including abort of the flight task mid-clone.
struct TempDirGuard {
    path: PathBuf,
    armed: bool,
}

impl TempDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove temporary clone directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use crate::config::{AuthMode, Config};

    fn test_config(root: &Path, auth_mode: AuthMode) -> Config {
        Config {
            listen_addr: "127.0.0.1:0".into(),
            upstream_base: None,
            cache_root: root.to_path_buf(),
            cache_size: None,
            upstream_timeout_secs: 20,
            auth_mode,
            log_level: "info".into(),
            user_agent: "mirrorcache/test".into(),
            allow_insecure_http: false,
            max_concurrent_syncs: 4,
        }
    }

    fn test_synchronizer(root: &Path, auth_mode: AuthMode) -> Arc<Synchronizer> {
        let config = test_config(root, auth_mode);
        let metrics = MetricsRegistry::new();
        let store = Arc::new(MirrorStore::new(root));
        let leases = Arc::new(LeaseTable::new());
        let cache = Arc::new(MirrorCache::new(
            Arc::clone(&store),
            Arc::clone(&leases),
            None,
            metrics.clone(),
        ));
        Arc::new(Synchronizer::new(
            store,
            cache,
            leases,
            Upstream::from_config(&config),
            config.max_concurrent_syncs,
            metrics,
        ))
    }

    fn seed_mirror(root: &Path, fingerprint: &str) {
        let path = root.join(format!("{fingerprint}.git"));
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    fn git_failure(stderr: &str) -> GitError {
        #[cfg(unix)]
        use std::os::unix::process::ExitStatusExt;
        GitError::Failed {
            op: "clone --mirror",
            status: std::process::ExitStatus::from_raw(128 << 8),
            stderr: stderr.to_string(),
        }
    }

    #[tokio::test]
    async fn on_miss_policy_is_a_hit_for_existing_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        seed_mirror(tmp.path(), "example.com/acme/widgets");
        let sync = test_synchronizer(tmp.path(), AuthMode::None);

        let fp = Fingerprint::parse("example.com/acme/widgets").unwrap();
        let (outcome, _lease) = sync
            .ensure_fresh(&fp, Scheme::Https, RefreshPolicy::OnMiss, None)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Hit);
        assert!(!outcome.performed_network());
    }

    #[tokio::test]
    async fn returned_lease_pins_the_mirror_against_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        seed_mirror(tmp.path(), "example.com/acme/widgets");
        let sync = test_synchronizer(tmp.path(), AuthMode::None);

        let fp = Fingerprint::parse("example.com/acme/widgets").unwrap();
        let (_, lease) = sync
            .ensure_fresh(&fp, Scheme::Https, RefreshPolicy::OnMiss, None)
            .await
            .unwrap();

        // While the caller holds the lease the sweep cannot take the
        // exclusive slot, so the mirror cannot be deleted.
        assert!(sync.leases.try_write("example.com/acme/widgets").is_none());
        drop(lease);
        assert!(sync.leases.try_write("example.com/acme/widgets").is_some());
    }

    #[test]
    fn classify_distinguishes_error_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let sync = test_synchronizer(tmp.path(), AuthMode::Passthrough);
        let fp = Fingerprint::parse("example.com/acme/widgets").unwrap();

        let cases: &[(&str, fn(&ProxyError) -> bool)] = &[
            ("fatal: repository 'x' not found", |e| {
                matches!(e, ProxyError::NotFound(_))
            }),
            ("fatal: Authentication failed for 'https://x'", |e| {
                matches!(e, ProxyError::Unauthorized(_))
            }),
            ("fatal: could not read Username for 'https://x'", |e| {
                matches!(e, ProxyError::Unauthorized(_))
            }),
            ("error: copy-fd: write returned: No space left on device", |e| {
                matches!(e, ProxyError::StorageFull(_))
            }),
            ("fatal: unable to access 'https://x': Connection refused", |e| {
                matches!(e, ProxyError::UpstreamUnavailable(_))
            }),
        ];
        for (stderr, check) in cases {
            let mapped = sync.classify(&git_failure(stderr), &fp);
            assert!(check(&mapped), "{stderr} mapped to {mapped:?}");
        }
    }

    #[test]
    fn auth_failures_map_to_not_found_without_passthrough() {
        let tmp = tempfile::tempdir().unwrap();
        let sync = test_synchronizer(tmp.path(), AuthMode::None);
        let fp = Fingerprint::parse("example.com/acme/private").unwrap();

        let mapped = sync.classify(
            &git_failure("fatal: Authentication failed for 'https://x'"),
            &fp,
        );
        assert!(matches!(mapped, ProxyError::NotFound(_)));
    }

    #[test]
    fn temp_paths_are_unique_and_not_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let sync = test_synchronizer(tmp.path(), AuthMode::None);
        let dest = tmp.path().join("example.com/acme/widgets.git");
        let parent = dest.parent().unwrap();

        let a = sync.temp_path(&dest, parent);
        let b = sync.temp_path(&dest, parent);
        assert_ne!(a, b);
        assert!(a.extension().map_or(true, |ext| ext != "git"));
    }

    #[tokio::test]
    async fn failed_first_time_sync_leaves_no_mirror() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            eprintln!("git not found in PATH; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let sync = test_synchronizer(tmp.path(), AuthMode::None);

        // Unroutable upstream: the clone fails fast with a hard error.
        let fp = Fingerprint::parse("127.0.0.1:1/acme/widgets").unwrap();
        let err = sync
            .ensure_fresh(&fp, Scheme::Https, RefreshPolicy::InfoRefs, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)), "{err:?}");

        assert!(!sync.store.exists(&fp));
        // No temporary directories survive the failure.
        let leftovers: Vec<_> = walk_files(tmp.path());
        assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    }

    fn walk_files(root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }
}
