//! Display names and avatars of other users, cached briefly.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::connectivity::ConnectivityMonitor;
use crate::models::ProfileSummary;
use crate::remote::RemoteStore;

const USERS: &str = "users";
const KEY_PREFIX: &str = "uid:";

fn cache_key(uid: &str) -> String {
  format!("{}{}", KEY_PREFIX, uid)
}

pub struct ProfileDirectory {
  remote: Arc<dyn RemoteStore>,
  connectivity: Arc<dyn ConnectivityMonitor>,
  cache: TtlCache<ProfileSummary>,
}

impl ProfileDirectory {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    ttl: Duration,
  ) -> Self {
    Self {
      remote,
      connectivity,
      cache: TtlCache::new(ttl),
    }
  }

  /// Summary of user `uid`, or `None` if unknown or unreachable.
  pub async fn summary(&self, uid: &str) -> Option<ProfileSummary> {
    let key = cache_key(uid);
    if let Some(summary) = self.cache.get(&key) {
      return Some(summary);
    }
    if !self.connectivity.is_online() {
      return None;
    }

    match self.remote.get(USERS, uid).await {
      Ok(Some(doc)) => {
        let summary = ProfileSummary::from_document(&doc);
        self.cache.put_default(&key, summary.clone());
        Some(summary)
      }
      Ok(None) => None,
      Err(e) if e.is_not_found() => None,
      Err(e) => {
        warn!(uid, error = %e, "Failed to fetch profile summary");
        None
      }
    }
  }

  /// Summaries for several users at once; unknown users are left out.
  pub async fn summaries(&self, uids: &[String]) -> HashMap<String, ProfileSummary> {
    let found = join_all(uids.iter().map(|uid| async move {
      self.summary(uid).await.map(|summary| (uid.clone(), summary))
    }))
    .await;
    found.into_iter().flatten().collect()
  }

  /// Drop the cached summary and fetch it again.
  pub async fn refresh(&self, uid: &str) -> Option<ProfileSummary> {
    self.cache.invalidate(&cache_key(uid));
    self.summary(uid).await
  }

  /// Prime the cache from data a listing already carried.
  pub fn remember(&self, uid: &str, summary: ProfileSummary) {
    debug!(uid, "Remembering profile summary");
    self.cache.put_default(&cache_key(uid), summary);
  }

  /// Every live summary, keyed by uid, for instant display.
  pub fn cached(&self) -> HashMap<String, ProfileSummary> {
    self
      .cache
      .snapshot()
      .into_iter()
      .filter_map(|(key, summary)| {
        key
          .strip_prefix(KEY_PREFIX)
          .map(|uid| (uid.to_string(), summary))
      })
      .collect()
  }

  pub fn clear(&self) {
    self.cache.clear();
  }
}
