//! Seams to the remote document store and blob store.
//!
//! Both are supplied by the host. Documents are JSON objects; collections are
//! slash paths such as `users/<uid>/portfolios`.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::SyncError;

pub type Document = serde_json::Map<String, Value>;

/// A document returned by a query, with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
  pub id: String,
  pub fields: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
  Eq(String, Value),
  /// Array field contains the value
  ArrayContains(String, Value),
  /// Array field contains at least one of the values
  ArrayContainsAny(String, Vec<Value>),
}

impl Condition {
  pub fn matches(&self, doc: &Document) -> bool {
    match self {
      Condition::Eq(field, value) => doc.get(field) == Some(value),
      Condition::ArrayContains(field, value) => array_field(doc, field).contains(value),
      Condition::ArrayContainsAny(field, values) => {
        let array = array_field(doc, field);
        values.iter().any(|v| array.contains(v))
      }
    }
  }
}

fn array_field<'a>(doc: &'a Document, field: &str) -> &'a [Value] {
  doc
    .get(field)
    .and_then(Value::as_array)
    .map(Vec::as_slice)
    .unwrap_or_default()
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
  pub conditions: Vec<Condition>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
    self
      .conditions
      .push(Condition::Eq(field.to_string(), value.into()));
    self
  }

  pub fn array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
    self
      .conditions
      .push(Condition::ArrayContains(field.to_string(), value.into()));
    self
  }

  pub fn array_contains_any<V: Into<Value>>(
    mut self,
    field: &str,
    values: impl IntoIterator<Item = V>,
  ) -> Self {
    self.conditions.push(Condition::ArrayContainsAny(
      field.to_string(),
      values.into_iter().map(Into::into).collect(),
    ));
    self
  }

  pub fn matches(&self, doc: &Document) -> bool {
    self.conditions.iter().all(|c| c.matches(doc))
  }
}

/// Remote document store. Every call may fail with any [`SyncError`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError>;

  /// Write `fields`. With `merge`, fields not named are kept; a missing
  /// document is created either way.
  async fn set(
    &self,
    collection: &str,
    id: &str,
    fields: Document,
    merge: bool,
  ) -> Result<(), SyncError>;

  /// Update named fields of an existing document. Fails with
  /// [`SyncError::NotFound`] if the document does not exist.
  async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), SyncError>;

  async fn delete(&self, collection: &str, id: &str) -> Result<(), SyncError>;

  async fn query(
    &self,
    collection: &str,
    filter: &Filter,
    limit: Option<usize>,
  ) -> Result<Vec<RemoteDocument>, SyncError>;

  /// Create a document with a server-generated id.
  async fn create(&self, collection: &str, fields: Document) -> Result<String, SyncError>;
}

/// Remote binary object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Upload `bytes` to `path`, returning the public URL.
  async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, SyncError>;

  async fn delete(&self, path: &str) -> Result<(), SyncError>;
}

/// Convert between serde representations via `serde_json::Value`.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

pub(crate) fn str_field(doc: &Document, field: &str) -> Option<String> {
  doc.get(field).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn bool_field(doc: &Document, field: &str) -> Option<bool> {
  doc.get(field).and_then(Value::as_bool)
}

pub(crate) fn i64_field(doc: &Document, field: &str) -> Option<i64> {
  doc.get(field).and_then(Value::as_i64)
}

pub(crate) fn u64_field(doc: &Document, field: &str) -> Option<u64> {
  doc.get(field).and_then(Value::as_u64)
}

pub(crate) fn string_list(doc: &Document, field: &str) -> Option<Vec<String>> {
  doc.get(field).and_then(Value::as_array).map(|values| {
    values
      .iter()
      .map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      })
      .collect()
  })
}
