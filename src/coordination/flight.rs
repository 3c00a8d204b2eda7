//! Per-fingerprint singleflight coalescing.
//!
//! The first request for a fingerprint spawns the synchronization on its
//! own task and becomes a waiter; concurrent requests for the same
//! fingerprint join as additional waiters and share the task's outcome.
//! The task outlives any individual client: it is aborted only when every
//! waiter has disconnected before a result was published. The record is
//! retired once the last waiter departs, so a later request starts a fresh
//! flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ProxyError;
use crate::sync::SyncOutcome;

pub type FlightResult = Result<SyncOutcome, ProxyError>;

struct Flight {
    waiters: AtomicUsize,
    rx: watch::Receiver<Option<FlightResult>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Flight {
    fn finished(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

type FlightMap = Mutex<HashMap<String, Arc<Flight>>>;

#[derive(Clone, Default)]
pub struct FlightGroup {
    inner: Arc<FlightMap>,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, coalescing with any in-flight run for the same
    /// key, and return the shared outcome.
    pub async fn run<F>(&self, key: &str, work: F) -> FlightResult
    where
        F: Future<Output = FlightResult> + Send + 'static,
    {
        let flight = {
            let mut map = self.inner.lock().unwrap();
            if let Some(existing) = map.get(key) {
                existing.waiters.fetch_add(1, Ordering::SeqCst);
                debug!(%key, "joined in-flight synchronization");
                Arc::clone(existing)
            } else {
                let (tx, rx) = watch::channel(None);
                let flight = Arc::new(Flight {
                    waiters: AtomicUsize::new(1),
                    rx,
                    task: Mutex::new(None),
                });
                let handle = tokio::spawn(async move {
                    let result = work.await;
                    let _ = tx.send(Some(result));
                });
                *flight.task.lock().unwrap() = Some(handle);
                map.insert(key.to_string(), Arc::clone(&flight));
                flight
            }
        };

        let _guard = WaiterGuard {
            group: Arc::clone(&self.inner),
            key: key.to_string(),
            flight: Arc::clone(&flight),
        };
        wait_for_result(&flight).await
    }
}

async fn wait_for_result(flight: &Flight) -> FlightResult {
    let mut rx = flight.rx.clone();
    loop {
        if let Some(result) = rx.borrow_and_update().as_ref() {
            return result.clone();
        }
        if rx.changed().await.is_err() {
            return Err(ProxyError::Internal(
                "synchronization task dropped without publishing a result".into(),
            ));
        }
    }
}

/// Tracks one waiter. Dropping the guard (normally or because the client
/// disconnected) releases the waiter slot; the last one out retires the
/// record and aborts the task if it never finished.
struct WaiterGuard {
    group: Arc<FlightMap>,
    key: String,
    flight: Arc<Flight>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.flight.waiters.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        let mut map = self.group.lock().unwrap();
        // A new waiter may have joined between the decrement and taking the
        // map lock; leave the record (and the task) alone in that case.
        if self.flight.waiters.load(Ordering::SeqCst) != 0 {
            return;
        }
        if let Some(current) = map.get(&self.key) {
            if Arc::ptr_eq(current, &self.flight) {
                map.remove(&self.key);
            }
        }
        if !self.flight.finished() {
            if let Some(handle) = self.flight.task.lock().unwrap().take() {
                debug!(key = %self.key, "all waiters gone; aborting in-flight synchronization");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_runs_share_one_execution() {
        let group = FlightGroup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let group = group.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("example.com/a/b", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(SyncOutcome::Cloned)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), SyncOutcome::Cloned);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_shared_with_every_waiter() {
        let group = FlightGroup::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = group.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("example.com/a/b", async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(ProxyError::UpstreamUnavailable("connection refused".into()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
        }
    }

    #[tokio::test]
    async fn completed_flights_are_retired() {
        let group = FlightGroup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            group
                .run("example.com/a/b", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(SyncOutcome::Fetched)
                })
                .await
                .unwrap();
        }
        // Sequential runs do not coalesce.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let group = FlightGroup::new();
        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for key in ["example.com/a/b", "example.com/c/d", "example.com/e/f"] {
            let group = group.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run(key, async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(SyncOutcome::Cloned)
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Three 50ms flights overlapping, not queueing.
        assert!(started.elapsed() < Duration::from_millis(140));
    }
}
