//! Generic keyed fetch cache.
//!
//! Every entity store wraps one of these: a keyed map of cached values with
//! per-entry fetch timestamps, a freshness window, a monotonically increasing
//! revision counter, and at-most-one-in-flight-fetch-per-key coordination.
//!
//! Concurrent callers for the same key share the outstanding request: the
//! first caller runs the fetch, later callers await a broadcast of its
//! outcome and then read the cache, so N concurrent gets produce exactly one
//! remote call.
//!
//! The entry and in-flight maps use synchronous locks, never held across an
//! await point; this lets the in-flight marker be cleaned up from a `Drop`
//! impl, so a fetch whose owning future is dropped mid-flight (timeout,
//! `select!`) releases the key instead of wedging every later caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::error::SyncError;

/// Map of keys with a fetch outstanding, shared with waiting callers.
pub(crate) type InFlightMap = Mutex<HashMap<String, broadcast::Sender<Result<(), SyncError>>>>;

/// Removes the in-flight marker for a key when its fetch ends, however it
/// ends. On a normal completion [`InFlightGuard::complete`] broadcasts the
/// real outcome; if the owning future is dropped instead, waiters get a
/// cancellation error rather than waiting forever.
pub(crate) struct InFlightGuard<'a> {
    map: &'a InFlightMap,
    key: &'a str,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    pub(crate) fn new(map: &'a InFlightMap, key: &'a str) -> Self {
        Self {
            map,
            key,
            armed: true,
        }
    }

    /// Remove the marker and broadcast the fetch outcome to waiters.
    pub(crate) fn complete(mut self, outcome: Result<(), SyncError>) {
        self.armed = false;
        if let Some(tx) = self.map.lock().unwrap().remove(self.key) {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(tx) = self.map.lock().unwrap().remove(self.key) {
            let _ = tx.send(Err(SyncError::internal(format!(
                "fetch for {} was cancelled",
                self.key
            ))));
        }
    }
}

/// A cached value with the time it was fetched.
///
/// An empty collection is as valid an entry as a populated one; freshness is
/// keyed on the entry's presence, never on the value's emptiness.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
}

/// Keyed fetch cache with freshness window and in-flight coordination.
pub struct FetchCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    /// Presence of a key here means a fetch is in flight ("loading").
    in_flight: InFlightMap,
    freshness: Duration,
    revision: AtomicU64,
    changes: broadcast::Sender<u64>,
}

impl<T: Clone> FetchCache<T> {
    /// Create a cache with the given freshness window.
    pub fn new(freshness: Duration) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            freshness,
            revision: AtomicU64::new(0),
            changes,
        }
    }

    /// Current revision. Bumped on every successful fetch or direct mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Subscribe to revision changes.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Read the cached value for a key, fresh or stale.
    pub async fn get(&self, key: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .map(|e| e.value.clone())
    }

    /// Whether a fetch for this key is currently in flight.
    pub async fn is_loading(&self, key: &str) -> bool {
        self.in_flight.lock().unwrap().contains_key(key)
    }

    /// Store a value directly, bumping the revision.
    pub async fn insert(&self, key: &str, value: T) {
        self.entries.write().unwrap().insert(
            key.to_string(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
        self.bump_revision();
    }

    /// Mutate an existing entry in place, bumping the revision.
    ///
    /// Returns `false` (without bumping) when nothing is cached for the key;
    /// optimistic edits only make sense on top of fetched data.
    pub async fn update<F>(&self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let found = {
            let mut entries = self.entries.write().unwrap();
            match entries.get_mut(key) {
                Some(entry) => {
                    mutate(&mut entry.value);
                    true
                }
                None => false,
            }
        };
        if found {
            self.bump_revision();
        }
        found
    }

    /// Drop all entries. In-flight fetches complete and repopulate harmlessly.
    pub async fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.bump_revision();
    }

    fn bump_revision(&self) {
        let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.changes.send(rev);
    }

    fn fresh_value(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        (entry.fetched_at.elapsed() < self.freshness).then(|| entry.value.clone())
    }

    /// Serve the key from cache, join an in-flight fetch, or run `fetch`.
    ///
    /// With `force` the freshness check is skipped, but an already in-flight
    /// fetch is still joined rather than duplicated. On failure the previous
    /// cached value (if any) is left intact and the error propagates to every
    /// waiting caller.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        force: bool,
        fetch: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        if !force {
            if let Some(value) = self.fresh_value(key) {
                return Ok(value);
            }
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    // Re-check under the lock: another caller may have
                    // completed a fetch between our freshness check and here.
                    if !force {
                        if let Some(value) = self.fresh_value(key) {
                            return Ok(value);
                        }
                    }
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            return match rx.recv().await {
                Ok(Ok(())) => self.get(key).await.ok_or_else(|| {
                    SyncError::internal(format!("fetch for {} completed without a value", key))
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::internal(format!(
                    "in-flight fetch for {} was dropped",
                    key
                ))),
            };
        }

        // This caller owns the fetch.
        let guard = InFlightGuard::new(&self.in_flight, key);
        let result = fetch().await;

        let outcome = match &result {
            Ok(value) => {
                self.entries.write().unwrap().insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                self.bump_revision();
                Ok(())
            }
            Err(e) => {
                log::error!("fetch failed for {}: {}", key, e);
                Err(e.clone())
            }
        };

        guard.complete(outcome);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn cache(window_secs: u64) -> Arc<FetchCache<Vec<i64>>> {
        Arc::new(FetchCache::new(Duration::from_secs(window_secs)))
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let cache = cache(3600);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec![1, 2, 3])
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("acme/widgets", false, || fetch(calls.clone())),
            cache.get_or_fetch("acme/widgets", false, || fetch(calls.clone())),
            cache.get_or_fetch("acme/widgets", false, || fetch(calls.clone())),
        );

        assert_eq!(a.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.unwrap(), vec![1, 2, 3]);
        assert_eq!(c.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_served_without_fetch() {
        let cache = cache(3600);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            cache
                .get_or_fetch("k", false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![7])
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_refetched() {
        // Zero-width freshness window: every entry is immediately stale.
        let cache = cache(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![7])
        };

        cache
            .get_or_fetch("k", false, || fetch(calls.clone()))
            .await
            .unwrap();
        cache
            .get_or_fetch("k", false, || fetch(calls.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_result_is_a_valid_fresh_entry() {
        let cache = cache(3600);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        };

        let first = cache
            .get_or_fetch("k", false, || fetch(calls.clone()))
            .await
            .unwrap();
        assert!(first.is_empty());

        // Second call must not treat the empty value as "nothing cached".
        cache
            .get_or_fetch("k", false, || fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_value() {
        let cache = cache(0);

        cache
            .get_or_fetch("k", false, || async { Ok(vec![1]) })
            .await
            .unwrap();

        let err = cache
            .get_or_fetch("k", false, || async {
                Err(SyncError::network("connection reset"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network { .. }));

        // Last good value survives.
        assert_eq!(cache.get("k").await, Some(vec![1]));
    }

    #[tokio::test]
    async fn test_failure_propagates_to_all_waiters() {
        let cache = cache(3600);

        let second_calls = Arc::new(AtomicUsize::new(0));
        let slow_fail = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(SyncError::network("boom"))
        };
        let counted = {
            let second_calls = second_calls.clone();
            || async move {
                second_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9])
            }
        };

        let (a, b): (Result<Vec<i64>, _>, Result<Vec<i64>, _>) = tokio::join!(
            cache.get_or_fetch("k", false, slow_fail),
            cache.get_or_fetch("k", false, counted),
        );
        assert!(a.is_err());
        assert!(b.is_err());
        // The joining caller shared the failed fetch; its own closure never ran.
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_skips_freshness_but_joins_in_flight() {
        let cache = cache(3600);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec![1])
        };

        cache
            .get_or_fetch("k", false, || fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Fresh, but force refetches.
        cache
            .get_or_fetch("k", true, || fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Two concurrent forced calls still share one fetch.
        let (a, b) = tokio::join!(
            cache.get_or_fetch("k", true, || fetch(calls.clone())),
            cache.get_or_fetch("k", true, || fetch(calls.clone())),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_revision_bumped_on_success_only() {
        let cache = cache(3600);
        assert_eq!(cache.revision(), 0);

        cache
            .get_or_fetch("k", false, || async { Ok(vec![1]) })
            .await
            .unwrap();
        assert_eq!(cache.revision(), 1);

        let _ = cache
            .get_or_fetch("k", true, || async {
                Err::<Vec<i64>, _>(SyncError::network("down"))
            })
            .await;
        assert_eq!(cache.revision(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sees_revision_change() {
        let cache = cache(3600);
        let mut rx = cache.subscribe();

        cache.insert("k", vec![1]).await;
        assert_eq!(rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_the_key() {
        let cache = cache(3600);

        // The owning future is dropped mid-fetch by the timeout.
        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch("k", false, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(vec![1])
            }),
        )
        .await;
        assert!(timed_out.is_err());

        // The key is released and a later caller fetches normally.
        assert!(!cache.is_loading("k").await);
        let value = cache
            .get_or_fetch("k", false, || async { Ok(vec![2]) })
            .await
            .unwrap();
        assert_eq!(value, vec![2]);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_unblocks_waiters() {
        let cache = cache(3600);

        let leader = cache.get_or_fetch("k", false, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1])
        });
        // Poll the leader once so it registers, then drop it.
        let timed_out = tokio::time::timeout(Duration::from_millis(10), async {
            let waiter = async {
                // Give the leader a head start before joining.
                tokio::time::sleep(Duration::from_millis(1)).await;
                cache.get_or_fetch("k", false, || async { Ok(vec![3]) }).await
            };
            tokio::join!(leader, waiter)
        })
        .await;

        // Both futures were dropped by the timeout; the key must be free.
        assert!(timed_out.is_err());
        assert!(!cache.is_loading("k").await);
    }
}
