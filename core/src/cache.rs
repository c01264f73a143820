//! Request deduplication cache.
//!
//! Collapses concurrent identical upstream calls (e.g. the same web search
//! issued twice while a response streams) into a single computation, and
//! serves recently-completed results without re-invoking the upstream
//! provider. Entries expire after a TTL and are evicted lazily on the next
//! lookup; there is no sweeper task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::time::Instant;

use chatflow_types::ToolError;

/// TTL used when none is configured (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A computation every concurrent caller of the same key awaits.
type InFlight<V> = Shared<BoxFuture<'static, Result<V, ToolError>>>;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
}

/// Keyed TTL cache with in-flight request tracking.
///
/// The core invariant: for any key, at most one upstream computation runs at
/// a time, no matter how many concurrent callers invoke [`execute`] with
/// that key. Failures propagate to every waiter of the shared computation
/// and are never cached - the next call retries.
///
/// Cheap to clone; clones share the same state.
///
/// [`execute`]: RequestCache::execute
pub struct RequestCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    ttl: Duration,
}

impl<V> Clone for RequestCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ttl: self.ttl,
        }
    }
}

impl<V> std::fmt::Debug for RequestCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<V> RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            })),
            ttl,
        }
    }

    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key` if it is still live.
    ///
    /// An entry older than the TTL is treated as absent and evicted here.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                tracing::debug!(key, "evicting expired cache entry");
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Run `compute` for `key`, deduplicating against live entries and
    /// in-flight computations.
    ///
    /// Resolution order:
    /// 1. A live cache entry is returned immediately; `compute` is not called.
    /// 2. An in-flight computation for the same key is awaited; `compute` is
    ///    not called.
    /// 3. Otherwise `compute()` starts, registered as the in-flight
    ///    computation for the key. On settlement the registration is removed;
    ///    on success the result is stored with the configured TTL.
    pub async fn execute<F, Fut>(&self, key: &str, compute: F) -> Result<V, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ToolError>> + Send + 'static,
    {
        let shared = {
            let mut inner = self.lock();

            match inner.entries.get(key) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    tracing::debug!(key, "request served from cache");
                    return Ok(entry.value.clone());
                }
                Some(_) => {
                    inner.entries.remove(key);
                }
                None => {}
            }

            if let Some(existing) = inner.in_flight.get(key) {
                tracing::debug!(key, "joining in-flight request");
                existing.clone()
            } else {
                let state = self.inner.clone();
                let owned_key = key.to_string();
                let fut = compute();
                let shared: InFlight<V> = async move {
                    let result = fut.await;
                    let mut inner = state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    inner.in_flight.remove(&owned_key);
                    match &result {
                        Ok(value) => {
                            inner.entries.insert(
                                owned_key,
                                CacheEntry {
                                    value: value.clone(),
                                    stored_at: Instant::now(),
                                },
                            );
                        }
                        Err(e) => {
                            // Failures are not cached; the next call retries.
                            tracing::warn!(key = %owned_key, error = %e, "upstream request failed");
                        }
                    }
                    result
                }
                .boxed()
                .shared();
                inner.in_flight.insert(key.to_string(), shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Drop all entries and in-flight registrations.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.in_flight.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // A poisoned lock only means another thread panicked mid-update of a
        // HashMap that stays structurally valid; recover the guard.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::future::join_all;
    use serde_json::{Value, json};

    use super::{Duration, RequestCache};

    fn counting_compute(
        counter: &'static AtomicUsize,
        value: Value,
    ) -> impl Future<Output = Result<Value, chatflow_types::ToolError>> + Send + 'static {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_compute_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let cache: RequestCache<Value> = RequestCache::with_default_ttl();

        let results = join_all((0..8).map(|_| {
            let cache = cache.clone();
            async move {
                cache
                    .execute("search:rust", || {
                        counting_compute(&CALLS, json!({"hits": 3}))
                    })
                    .await
            }
        }))
        .await;

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), json!({"hits": 3}));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_share_computations() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let cache: RequestCache<Value> = RequestCache::with_default_ttl();

        let a = cache.execute("key-a", || counting_compute(&CALLS, json!(1)));
        let b = cache.execute("key-b", || counting_compute(&CALLS, json!(2)));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let ttl = Duration::from_secs(300);
        let cache: RequestCache<Value> = RequestCache::new(ttl);

        cache
            .execute("k", || counting_compute(&CALLS, json!("v")))
            .await
            .unwrap();
        assert_eq!(cache.get("k"), Some(json!("v")));

        tokio::time::advance(ttl + Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);

        // A fresh execute recomputes rather than serving the stale entry.
        cache
            .execute("k", || counting_compute(&CALLS, json!("v2")))
            .await
            .unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("k"), Some(json!("v2")));
    }

    #[tokio::test(start_paused = true)]
    async fn live_entry_skips_computation() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let cache: RequestCache<Value> = RequestCache::with_default_ttl();

        for _ in 0..3 {
            cache
                .execute("stable", || counting_compute(&CALLS, json!(true)))
                .await
                .unwrap();
        }

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_propagate_to_all_waiters_and_are_not_cached() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let cache: RequestCache<Value> = RequestCache::with_default_ttl();

        let failing = |counter: &'static AtomicUsize| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(chatflow_types::ToolError::execution("upstream down"))
            }
        };

        let a = cache.execute("flaky", || failing(&CALLS));
        let b = cache.execute("flaky", || failing(&CALLS));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(a.is_err());
        assert!(b.is_err());

        // The failure was not cached; the next call retries.
        let retry = cache
            .execute("flaky", || counting_compute(&CALLS, json!("ok")))
            .await;
        assert_eq!(retry.unwrap(), json!("ok"));
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
