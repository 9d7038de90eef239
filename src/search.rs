//! Skill search over public user profiles.

use chrono::Utc;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheResult, CoalescingCache};
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::models::{SearchPage, UserCard};
use crate::remote::{Filter, RemoteStore};
use crate::store::{RecordStore, SqliteStore};

const USERS: &str = "users";
const SKILLS_FIELD: &str = "skillsOrTopics";
const PERSISTED_KIND: &str = "search";
const ANY_FETCH_LIMIT: usize = 400;
const ALL_FETCH_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
  /// Users with at least one of the terms, most matches first
  #[default]
  Any,
  /// Users with every term
  All,
}

impl SearchMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      SearchMode::Any => "any",
      SearchMode::All => "all",
    }
  }

  pub fn parse(s: &str) -> Self {
    if s.trim().eq_ignore_ascii_case("all") {
      SearchMode::All
    } else {
      SearchMode::Any
    }
  }
}

pub struct SearchRepository {
  remote: Arc<dyn RemoteStore>,
  connectivity: Arc<dyn ConnectivityMonitor>,
  store: Arc<SqliteStore>,
  cache: CoalescingCache<SearchPage>,
  max_terms: usize,
}

impl SearchRepository {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    store: Arc<SqliteStore>,
    cache: CoalescingCache<SearchPage>,
    max_terms: usize,
  ) -> Self {
    Self {
      remote,
      connectivity,
      store,
      cache,
      max_terms,
    }
  }

  pub fn cache(&self) -> &CoalescingCache<SearchPage> {
    &self.cache
  }

  /// Search public users by skill.
  ///
  /// Served from memory when cached, else fetched once for all concurrent
  /// callers. When the remote cannot answer, the last persisted result for
  /// the same query is served; only with no such result is an error
  /// returned.
  pub async fn search<I, S>(
    &self,
    terms: I,
    mode: SearchMode,
    limit: usize,
  ) -> Result<CacheResult<Vec<UserCard>>, SyncError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let key = CacheKey::with_limit(terms, self.max_terms);
    if key.is_empty() || limit == 0 {
      return Ok(CacheResult::from_network(Vec::new()));
    }
    let scoped = key.scoped(&format!("{}|{}", mode.as_str(), limit));

    if let Some(page) = self.cache.get(&scoped) {
      return Ok(CacheResult::from_cache(page.users, page.fetched_at));
    }

    if !self.connectivity.is_online() {
      return self.persisted(&scoped).ok_or(SyncError::Offline);
    }

    let remote = Arc::clone(&self.remote);
    let terms = key.terms().to_vec();
    let fetched = self
      .cache
      .get_or_fetch(&scoped, move || fetch(remote, terms, mode, limit))
      .await;

    match fetched {
      Ok(page) => {
        let storage_key = CacheKey::storage_hash(&scoped);
        if let Err(e) = self.store.set(PERSISTED_KIND, &storage_key, &page) {
          warn!(key = %scoped, error = %e, "Failed to persist search results");
        }
        Ok(CacheResult::from_network(page.users))
      }
      Err(e) => {
        warn!(key = %scoped, error = %e, "Search failed, trying persisted results");
        self.persisted(&scoped).ok_or_else(|| {
          e.upstream()
            .cloned()
            .unwrap_or_else(|| SyncError::transient(e.to_string()))
        })
      }
    }
  }

  fn persisted(&self, scoped: &str) -> Option<CacheResult<Vec<UserCard>>> {
    match self
      .store
      .get::<SearchPage>(PERSISTED_KIND, &CacheKey::storage_hash(scoped))
    {
      Ok(page) => page.map(|page| CacheResult::offline(page.users, page.fetched_at)),
      Err(e) => {
        warn!(error = %e, "Failed to read persisted search results");
        None
      }
    }
  }
}

async fn fetch(
  remote: Arc<dyn RemoteStore>,
  terms: Vec<String>,
  mode: SearchMode,
  limit: usize,
) -> Result<SearchPage, SyncError> {
  let base = Filter::new().eq("isPublic", true);
  let (filter, fetch_limit) = match mode {
    SearchMode::Any => (
      base.array_contains_any(SKILLS_FIELD, terms.iter().map(String::as_str)),
      ANY_FETCH_LIMIT,
    ),
    SearchMode::All => (
      base.array_contains(SKILLS_FIELD, terms[0].as_str()),
      ALL_FETCH_LIMIT,
    ),
  };

  let docs = remote.query(USERS, &filter, Some(fetch_limit)).await?;
  let users = docs
    .iter()
    .map(|doc| UserCard::from_document(&doc.id, &doc.fields))
    .collect();
  let users = rank(users, &terms, mode, limit);
  debug!(mode = mode.as_str(), terms = terms.len(), results = users.len(), "Search fetched");

  Ok(SearchPage {
    users,
    fetched_at: Utc::now(),
  })
}

/// Order candidates for `terms` (already folded) and keep the best `limit`.
///
/// Any: users matching at least one term, by match count then skill count.
/// All: users having every term, by skill count. Private users never match.
pub fn rank(
  users: Vec<UserCard>,
  terms: &[String],
  mode: SearchMode,
  limit: usize,
) -> Vec<UserCard> {
  let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();

  let mut ranked: Vec<(usize, UserCard)> = users
    .into_iter()
    .filter(|user| user.is_public)
    .map(|user| {
      let matched: HashSet<&str> = user
        .skills
        .iter()
        .map(String::as_str)
        .filter(|skill| wanted.contains(skill))
        .collect();
      (matched.len(), user)
    })
    .filter(|(matched, _)| match mode {
      SearchMode::Any => *matched > 0,
      SearchMode::All => *matched == wanted.len(),
    })
    .collect();

  // Stable sorts keep the remote order among equals
  match mode {
    SearchMode::Any => {
      ranked.sort_by_key(|(matched, user)| (Reverse(*matched), Reverse(user.skills.len())))
    }
    SearchMode::All => ranked.sort_by_key(|(_, user)| Reverse(user.skills.len())),
  }

  ranked.into_iter().take(limit).map(|(_, user)| user).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::connectivity::ManualConnectivity;
  use crate::testing::FakeRemote;
  use serde_json::json;

  fn card(id: &str, skills: &[&str], public: bool) -> UserCard {
    UserCard {
      id: id.into(),
      skills: skills.iter().map(|s| s.to_string()).collect(),
      is_public: public,
      ..UserCard::default()
    }
  }

  fn terms(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| t.to_string()).collect()
  }

  fn ids(users: &[UserCard]) -> Vec<&str> {
    users.iter().map(|u| u.id.as_str()).collect()
  }

  struct Setup {
    remote: Arc<FakeRemote>,
    net: Arc<ManualConnectivity>,
    store: Arc<SqliteStore>,
    repo: SearchRepository,
  }

  fn setup() -> Setup {
    let remote = FakeRemote::new();
    remote.insert(USERS, "ana", json!({ "isPublic": true, "skillsOrTopics": ["rust", "sql"] }));
    remote.insert(USERS, "bo", json!({ "isPublic": true, "skillsOrTopics": ["rust"] }));
    remote.insert(USERS, "cy", json!({ "isPublic": false, "skillsOrTopics": ["rust", "sql"] }));
    remote.insert(USERS, "di", json!({ "isPublic": true, "skillsOrTopics": ["design"] }));

    let net = Arc::new(ManualConnectivity::new(true));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let repo = SearchRepository::new(
      remote.clone(),
      net.clone(),
      Arc::clone(&store),
      CoalescingCache::new(20_000, 200),
      10,
    );
    Setup {
      remote,
      net,
      store,
      repo,
    }
  }

  #[test]
  fn test_rank_any_orders_by_matches_then_skills() {
    let users = vec![
      card("one", &["rust"], true),
      card("many", &["go", "java", "kotlin", "rust"], true),
      card("both", &["rust", "sql"], true),
      card("none", &["design"], true),
      card("hidden", &["rust", "sql"], false),
    ];
    let ranked = rank(users, &terms(&["rust", "sql"]), SearchMode::Any, 10);
    assert_eq!(ids(&ranked), vec!["both", "many", "one"]);
  }

  #[test]
  fn test_rank_all_requires_every_term() {
    let users = vec![
      card("short", &["rust", "sql"], true),
      card("partial", &["rust"], true),
      card("long", &["sql", "go", "rust"], true),
    ];
    let ranked = rank(users, &terms(&["rust", "sql"]), SearchMode::All, 10);
    assert_eq!(ids(&ranked), vec!["long", "short"]);

    let users = vec![card("a", &["x"], true), card("b", &["x"], true)];
    assert_eq!(rank(users, &terms(&["x"]), SearchMode::All, 1).len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_searches_share_one_query() {
    let s = setup();
    let (a, b, c) = tokio::join!(
      s.repo.search(["Rust", "SQL"], SearchMode::Any, 20),
      s.repo.search(["sql", "rust"], SearchMode::Any, 20),
      s.repo.search([" rust ", "sql", ""], SearchMode::Any, 20),
    );

    assert_eq!(s.remote.count("query"), 1);
    let a = a.unwrap();
    assert_eq!(ids(&a.data), vec!["ana", "bo"]);
    assert_eq!(b.unwrap().data, a.data);
    assert_eq!(c.unwrap().data, a.data);

    let again = s.repo.search(["rust", "sql"], SearchMode::Any, 20).await.unwrap();
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert_eq!(s.remote.count("query"), 1);

    s.repo.search(["rust", "sql"], SearchMode::All, 20).await.unwrap();
    assert_eq!(s.remote.count("query"), 2);
  }

  #[tokio::test]
  async fn test_failure_is_not_cached() {
    let s = setup();
    s.remote.fail("query", USERS, None, SyncError::transient("503"));
    let err = s.repo.search(["rust"], SearchMode::Any, 5).await.unwrap_err();
    assert!(err.is_retryable());

    s.remote.heal();
    let result = s.repo.search(["rust"], SearchMode::Any, 5).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(ids(&result.data), vec!["ana", "bo"]);
  }

  #[tokio::test]
  async fn test_persisted_results_serve_offline_and_on_failure() {
    let s = setup();
    let online = s.repo.search(["rust"], SearchMode::Any, 5).await.unwrap();

    let fresh = SearchRepository::new(
      s.remote.clone(),
      s.net.clone(),
      Arc::clone(&s.store),
      CoalescingCache::new(20_000, 200),
      10,
    );
    s.net.set_online(false);
    let offline = fresh.search(["RUST"], SearchMode::Any, 5).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, online.data);
    assert!(offline.cached_at.is_some());

    s.net.set_online(true);
    s.remote.fail_everything(Some(SyncError::transient("reset")));
    let failed_over = fresh.search(["rust"], SearchMode::Any, 5).await.unwrap();
    assert_eq!(failed_over.source, CacheSource::Offline);

    s.net.set_online(false);
    assert_eq!(
      fresh.search(["java"], SearchMode::Any, 5).await.unwrap_err(),
      SyncError::Offline
    );
  }

  #[tokio::test]
  async fn test_empty_query_skips_remote() {
    let s = setup();
    let result = s.repo.search([" ", ""], SearchMode::Any, 5).await.unwrap();
    assert!(result.data.is_empty());
    assert_eq!(s.remote.count("query"), 0);
    assert_eq!(SearchMode::parse("ALL"), SearchMode::All);
  }
}
