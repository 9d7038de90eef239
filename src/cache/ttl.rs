//! Fixed-lifetime cache for small derived values.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct TtlEntry<V> {
  value: V,
  expires_at: Instant,
}

impl<V> TtlEntry<V> {
  fn is_live(&self, now: Instant) -> bool {
    now < self.expires_at
  }
}

/// Expiry is checked lazily: an expired entry is dropped by the read that
/// finds it.
pub struct TtlCache<V> {
  entries: Mutex<HashMap<String, TtlEntry<V>>>,
  default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      default_ttl,
    }
  }

  pub fn put(&self, key: &str, value: V, ttl: Duration) {
    let entry = TtlEntry {
      value,
      expires_at: Instant::now() + ttl,
    };
    self.entries.lock().insert(key.to_string(), entry);
  }

  pub fn put_default(&self, key: &str, value: V) {
    self.put(key, value, self.default_ttl);
  }

  pub fn get(&self, key: &str) -> Option<V> {
    let mut entries = self.entries.lock();
    let now = Instant::now();
    match entries.get(key) {
      Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    }
  }

  pub fn invalidate(&self, key: &str) {
    self.entries.lock().remove(key);
  }

  pub fn clear(&self) {
    self.entries.lock().clear();
  }

  /// All live entries, pruning the expired ones.
  pub fn snapshot(&self) -> HashMap<String, V> {
    let mut entries = self.entries.lock();
    let now = Instant::now();
    entries.retain(|_, entry| entry.is_live(now));
    entries
      .iter()
      .map(|(key, entry)| (key.clone(), entry.value.clone()))
      .collect()
  }

  /// Number of stored entries, expired ones included until read.
  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }
}
