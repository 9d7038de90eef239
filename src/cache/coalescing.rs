//! Weighted LRU cache with in-flight fetch deduplication.
//!
//! Every lookup takes the same mutex: the cache check, the in-flight check
//! and the registration of a new fetch happen in one critical section, so at
//! most one fetch per key is ever running. The fetch itself runs in a
//! spawned task outside the lock; its completion removes the in-flight
//! marker and stores the value under the lock again, so a key is never both
//! cached and in flight.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::{FetchError, SyncError};

/// Cost units of a cached value. The weight of an entry is
/// `units * unit_cost + key.len()`.
pub trait Weighted {
  fn units(&self) -> usize;
}

impl<T> Weighted for Vec<T> {
  fn units(&self) -> usize {
    self.len()
  }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct Inner<V> {
  entries: LruCache<String, (V, usize)>,
  total_weight: usize,
  in_flight: HashMap<String, SharedFetch<V>>,
  capacity: usize,
  unit_cost: usize,
}

impl<V: Weighted> Inner<V> {
  fn weight_of(&self, key: &str, value: &V) -> usize {
    value
      .units()
      .saturating_mul(self.unit_cost)
      .saturating_add(key.len())
  }

  fn insert(&mut self, key: String, value: V) {
    let weight = self.weight_of(&key, &value);
    if let Some((_, old_weight)) = self.entries.pop(&key) {
      self.total_weight -= old_weight;
    }

    if weight > self.capacity {
      debug!(key = %key, weight, capacity = self.capacity, "Entry exceeds cache capacity, not retained");
      return;
    }

    self.entries.put(key, (value, weight));
    self.total_weight += weight;

    while self.total_weight > self.capacity {
      match self.entries.pop_lru() {
        Some((evicted, (_, evicted_weight))) => {
          self.total_weight -= evicted_weight;
          debug!(key = %evicted, weight = evicted_weight, "Evicted cache entry");
        }
        None => break,
      }
    }
  }
}

/// Removes the in-flight marker if the fetch task unwinds or is aborted
/// before reaching its completion path.
struct InFlightGuard<V> {
  inner: Arc<Mutex<Inner<V>>>,
  key: Option<String>,
}

impl<V> InFlightGuard<V> {
  fn disarm(mut self) -> String {
    self.key.take().unwrap_or_default()
  }
}

impl<V> Drop for InFlightGuard<V> {
  fn drop(&mut self) {
    if let Some(key) = self.key.take() {
      warn!(key = %key, "Fetch task ended without settling");
      self.inner.lock().in_flight.remove(&key);
    }
  }
}

/// Bounded cache shared by every consumer of one kind of query.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct CoalescingCache<V> {
  inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for CoalescingCache<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V> CoalescingCache<V>
where
  V: Weighted + Clone + Send + Sync + 'static,
{
  pub fn new(capacity: usize, unit_cost: usize) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: LruCache::unbounded(),
        total_weight: 0,
        in_flight: HashMap::new(),
        capacity,
        unit_cost,
      })),
    }
  }

  /// Return the cached value for `key`, or run `fetch` once for all
  /// concurrent callers of the same key.
  ///
  /// Failures are shared by every waiter and never cached; the next call
  /// for the key starts a fresh fetch.
  pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V, FetchError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, SyncError>> + Send + 'static,
  {
    let pending = {
      let mut inner = self.inner.lock();
      if let Some((value, _)) = inner.entries.get(key) {
        trace!(key = %key, "Cache hit");
        return Ok(value.clone());
      }

      match inner.in_flight.get(key) {
        Some(existing) => {
          debug!(key = %key, "Joining in-flight fetch");
          existing.clone()
        }
        None => {
          let pending = self.spawn_fetch(key.to_string(), fetch);
          inner.in_flight.insert(key.to_string(), pending.clone());
          pending
        }
      }
    };

    pending.await
  }

  fn spawn_fetch<F, Fut>(&self, key: String, fetch: F) -> SharedFetch<V>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, SyncError>> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    let handle = tokio::spawn(async move {
      let guard = InFlightGuard {
        inner: Arc::clone(&inner),
        key: Some(key),
      };

      let result = fetch().await;

      let key = guard.disarm();
      let mut inner = inner.lock();
      inner.in_flight.remove(&key);
      match &result {
        Ok(value) => inner.insert(key, value.clone()),
        Err(e) => debug!(key = %key, error = %e, "Fetch failed, nothing cached"),
      }
      result.map_err(FetchError::from)
    });

    async move { handle.await.unwrap_or(Err(FetchError::Aborted)) }
      .boxed()
      .shared()
  }

  /// Look up `key`, marking it most recently used.
  pub fn get(&self, key: &str) -> Option<V> {
    self
      .inner
      .lock()
      .entries
      .get(key)
      .map(|(value, _)| value.clone())
  }

  /// Insert directly, e.g. to pre-populate from another listing.
  pub fn put(&self, key: &str, value: V) {
    self.inner.lock().insert(key.to_string(), value);
  }

  pub fn invalidate(&self, key: &str) -> bool {
    let mut inner = self.inner.lock();
    match inner.entries.pop(key) {
      Some((_, weight)) => {
        inner.total_weight -= weight;
        true
      }
      None => false,
    }
  }

  /// Drop every cached entry. Running fetches still complete and store
  /// their results.
  pub fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.total_weight = 0;
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn total_weight(&self) -> usize {
    self.inner.lock().total_weight
  }

  pub fn in_flight_len(&self) -> usize {
    self.inner.lock().in_flight.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn counting_fetch(
    calls: Arc<AtomicUsize>,
    value: Vec<u32>,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<u32>, SyncError>> + Send + 'static {
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_callers_share_one_fetch() {
    let cache = CoalescingCache::<Vec<u32>>::new(10_000, 1);
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..8).map(|_| {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      async move {
        cache
          .get_or_fetch("k", counting_fetch(calls, vec![1, 2, 3]))
          .await
      }
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
      assert_eq!(result.unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(cache.in_flight_len(), 0);
    assert_eq!(cache.get("k"), Some(vec![1, 2, 3]));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_single_fetch_across_worker_threads() {
    let cache = CoalescingCache::<Vec<u32>>::new(10_000, 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let mut handles = Vec::new();
    for _ in 0..16 {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      let mut release_rx = release_rx.clone();
      handles.push(tokio::spawn(async move {
        cache
          .get_or_fetch("shared", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.wait_for(|released| *released).await;
            Ok(vec![7])
          })
          .await
      }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    release_tx.send_replace(true);

    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap(), vec![7]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_distinct_keys_fetch_independently() {
    let cache = CoalescingCache::<Vec<u32>>::new(10_000, 1);
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      cache.get_or_fetch("a", counting_fetch(Arc::clone(&calls), vec![1])),
      cache.get_or_fetch("b", counting_fetch(Arc::clone(&calls), vec![2])),
    );

    assert_eq!(a.unwrap(), vec![1]);
    assert_eq!(b.unwrap(), vec![2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failure_shared_and_not_cached() {
    let cache = CoalescingCache::<Vec<u32>>::new(10_000, 1);
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = |calls: Arc<AtomicUsize>| {
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<Vec<u32>, _>(SyncError::transient("connection reset"))
      }
    };

    let (first, second) = tokio::join!(
      cache.get_or_fetch("k", failing(Arc::clone(&calls))),
      cache.get_or_fetch("k", failing(Arc::clone(&calls))),
    );
    let expected = FetchError::Upstream(SyncError::transient("connection reset"));
    assert_eq!(first.unwrap_err(), expected);
    assert_eq!(second.unwrap_err(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());

    // No negative caching: the next call fetches again.
    let retried = cache
      .get_or_fetch("k", counting_fetch(Arc::clone(&calls), vec![9]))
      .await;
    assert_eq!(retried.unwrap(), vec![9]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_get_protects_entry_from_next_eviction() {
    // Each entry weighs 1 * 10 + 1 = 11; three fit.
    let cache = CoalescingCache::<Vec<u32>>::new(33, 10);
    cache.put("a", vec![1]);
    cache.put("b", vec![2]);
    cache.put("c", vec![3]);
    assert_eq!(cache.total_weight(), 33);

    assert!(cache.get("a").is_some());
    cache.put("d", vec![4]);

    assert!(cache.get("a").is_some());
    assert!(cache.get("b").is_none());
    assert!(cache.get("c").is_some());
    assert!(cache.get("d").is_some());
    assert_eq!(cache.total_weight(), 33);
  }

  #[tokio::test]
  async fn test_heavy_insert_evicts_several() {
    let cache = CoalescingCache::<Vec<u32>>::new(40, 10);
    cache.put("a", vec![1]);
    cache.put("b", vec![2]);
    cache.put("big", vec![1, 2, 3]);

    assert!(cache.get("a").is_none());
    assert!(cache.get("b").is_none());
    assert_eq!(cache.total_weight(), 33);
  }

  #[tokio::test]
  async fn test_oversize_entry_not_retained() {
    let cache = CoalescingCache::<Vec<u32>>::new(20, 10);
    cache.put("small", vec![1]);
    cache.put("huge", vec![1, 2, 3]);

    assert!(cache.get("huge").is_none());
    assert!(cache.get("small").is_some());
    assert_eq!(cache.total_weight(), 15);
  }

  #[tokio::test]
  async fn test_replacing_key_updates_weight() {
    let cache = CoalescingCache::<Vec<u32>>::new(100, 10);
    cache.put("k", vec![1, 2]);
    cache.put("k", vec![1]);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_weight(), 11);
    assert!(cache.invalidate("k"));
    assert_eq!(cache.total_weight(), 0);
  }

  #[tokio::test]
  async fn test_panicking_fetch_reports_aborted() {
    let cache = CoalescingCache::<Vec<u32>>::new(100, 1);
    let result = cache
      .get_or_fetch("boom", || async {
        if cache_test_should_panic() {
          panic!("fetch exploded");
        }
        Ok(vec![])
      })
      .await;

    assert_eq!(result.unwrap_err(), FetchError::Aborted);
    assert_eq!(cache.in_flight_len(), 0);

    let calls = Arc::new(AtomicUsize::new(0));
    let retried = cache
      .get_or_fetch("boom", counting_fetch(Arc::clone(&calls), vec![1]))
      .await;
    assert_eq!(retried.unwrap(), vec![1]);
  }

  fn cache_test_should_panic() -> bool {
    true
  }
}
