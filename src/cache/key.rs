//! Canonical lookup keys for free-text query terms.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// A set of query terms reduced to one deterministic key.
///
/// Terms are folded (diacritics stripped, lowercased, trimmed), empty terms
/// dropped and repeats removed. A term limit keeps the first distinct terms
/// as given; the survivors are then sorted. Two inputs naming the same terms
/// in any order or casing produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  terms: Vec<String>,
  canonical: String,
}

impl CacheKey {
  pub fn new<I, S>(terms: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self::with_limit(terms, usize::MAX)
  }

  /// Like [`CacheKey::new`], keeping the first `max_terms` distinct terms
  /// in input order.
  pub fn with_limit<I, S>(terms: I, max_terms: usize) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut seen = HashSet::new();
    let mut terms: Vec<String> = terms
      .into_iter()
      .map(|t| fold_term(t.as_ref()))
      .filter(|t| !t.is_empty() && seen.insert(t.clone()))
      .take(max_terms)
      .collect();
    terms.sort();

    let canonical = terms.join(",");
    Self { terms, canonical }
  }

  /// Parse a comma-separated term list, as typed into a search box.
  pub fn parse_csv(csv: &str, max_terms: usize) -> Self {
    Self::with_limit(csv.split(','), max_terms)
  }

  pub fn terms(&self) -> &[String] {
    &self.terms
  }

  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  pub fn is_empty(&self) -> bool {
    self.terms.is_empty()
  }

  /// Prefix the key with a namespace, e.g. `any|20|java,rust`.
  pub fn scoped(&self, scope: &str) -> String {
    format!("{}|{}", scope, self.canonical)
  }

  /// Fixed-length key for durable storage.
  pub fn storage_hash(scoped: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scoped.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Case and diacritic fold: `"  Diseño "` becomes `"diseno"`.
pub fn fold_term(term: &str) -> String {
  term
    .trim()
    .nfd()
    .filter(|c| !is_combining_mark(*c))
    .collect::<String>()
    .to_lowercase()
}
