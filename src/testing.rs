//! In-memory remote and blob stores with failure injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::connectivity::ManualConnectivity;
use crate::error::SyncError;
use crate::remote::{BlobStore, Document, Filter, RemoteDocument, RemoteStore};
use crate::store::{BlobStaging, SqliteStore};
use crate::sync::SyncContext;

/// Fakes wired into a [`SyncContext`] over an in-memory database and a
/// temporary staging directory.
pub struct TestBed {
  pub remote: Arc<FakeRemote>,
  pub blobs: Arc<FakeBlobs>,
  pub net: Arc<ManualConnectivity>,
  pub store: Arc<SqliteStore>,
  pub ctx: SyncContext,
  pub dir: tempfile::TempDir,
}

impl TestBed {
  pub fn new(uid: &str, online: bool) -> Self {
    let remote = FakeRemote::new();
    let blobs = FakeBlobs::new();
    let net = Arc::new(ManualConnectivity::new(online));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let ctx = SyncContext {
      uid: uid.to_string(),
      store: Arc::clone(&store),
      remote: remote.clone(),
      blobs: blobs.clone(),
      connectivity: net.clone(),
      staging: BlobStaging::new(dir.path().join("blobs")),
    };
    Self {
      remote,
      blobs,
      net,
      store,
      ctx,
      dir,
    }
  }
}

fn op_key(op: &str, collection: &str, id: Option<&str>) -> String {
  match id {
    Some(id) => format!("{}:{}/{}", op, collection, id),
    None => format!("{}:{}", op, collection),
  }
}

/// Holds one remote call until released.
#[derive(Default)]
pub struct Gate {
  reached: Notify,
  released: Notify,
}

impl Gate {
  /// Wait until the gated call has started.
  pub async fn reached(&self) {
    self.reached.notified().await;
  }

  pub fn release(&self) {
    self.released.notify_one();
  }
}

#[derive(Default)]
pub struct FakeRemote {
  collections: Mutex<BTreeMap<String, BTreeMap<String, Document>>>,
  failures: Mutex<HashMap<String, SyncError>>,
  blocked: Mutex<HashSet<String>>,
  gates: Mutex<HashMap<String, Arc<Gate>>>,
  fail_all: Mutex<Option<SyncError>>,
  calls: Mutex<Vec<String>>,
  next_id: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn insert(&self, collection: &str, id: &str, fields: Value) {
    let fields = match fields {
      Value::Object(map) => map,
      _ => Document::new(),
    };
    self
      .collections
      .lock()
      .entry(collection.to_string())
      .or_default()
      .insert(id.to_string(), fields);
  }

  pub fn doc(&self, collection: &str, id: &str) -> Option<Document> {
    self
      .collections
      .lock()
      .get(collection)
      .and_then(|docs| docs.get(id).cloned())
  }

  pub fn ids(&self, collection: &str) -> Vec<String> {
    self
      .collections
      .lock()
      .get(collection)
      .map(|docs| docs.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Fail `op` on one document (`id`) or on a whole collection.
  pub fn fail(&self, op: &str, collection: &str, id: Option<&str>, error: SyncError) {
    self
      .failures
      .lock()
      .insert(op_key(op, collection, id), error);
  }

  /// Make `op` on a document hang until the caller is dropped.
  pub fn block(&self, op: &str, collection: &str, id: &str) {
    self.blocked.lock().insert(op_key(op, collection, Some(id)));
  }

  /// Hold the next `op` on a document (`id`) or collection until the
  /// returned gate is released.
  pub fn pause(&self, op: &str, collection: &str, id: Option<&str>) -> Arc<Gate> {
    let gate = Arc::new(Gate::default());
    self
      .gates
      .lock()
      .insert(op_key(op, collection, id), Arc::clone(&gate));
    gate
  }

  pub fn fail_everything(&self, error: Option<SyncError>) {
    *self.fail_all.lock() = error;
  }

  pub fn heal(&self) {
    self.failures.lock().clear();
    self.blocked.lock().clear();
    *self.fail_all.lock() = None;
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().clone()
  }

  pub fn count(&self, op: &str) -> usize {
    let prefix = format!("{}:", op);
    self
      .calls
      .lock()
      .iter()
      .filter(|c| c.starts_with(&prefix))
      .count()
  }

  async fn check(&self, op: &str, collection: &str, id: Option<&str>) -> Result<(), SyncError> {
    let key = op_key(op, collection, id);
    self.calls.lock().push(key.clone());

    let fail_all = self.fail_all.lock().clone();
    if let Some(error) = fail_all {
      return Err(error);
    }
    let gate = self.gates.lock().remove(&key);
    if let Some(gate) = gate {
      gate.reached.notify_one();
      gate.released.notified().await;
    }
    let blocked = self.blocked.lock().contains(&key);
    if blocked {
      futures::future::pending::<()>().await;
    }
    let failures = self.failures.lock();
    if let Some(error) = failures.get(&key) {
      return Err(error.clone());
    }
    if let Some(error) = failures.get(&op_key(op, collection, None)) {
      return Err(error.clone());
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError> {
    self.check("get", collection, Some(id)).await?;
    Ok(self.doc(collection, id))
  }

  async fn set(
    &self,
    collection: &str,
    id: &str,
    fields: Document,
    merge: bool,
  ) -> Result<(), SyncError> {
    self.check("set", collection, Some(id)).await?;
    let mut collections = self.collections.lock();
    let docs = collections.entry(collection.to_string()).or_default();
    if merge {
      if let Some(existing) = docs.get_mut(id) {
        existing.extend(fields);
        return Ok(());
      }
    }
    docs.insert(id.to_string(), fields);
    Ok(())
  }

  async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), SyncError> {
    self.check("update", collection, Some(id)).await?;
    let mut collections = self.collections.lock();
    match collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
      Some(existing) => {
        existing.extend(fields);
        Ok(())
      }
      None => Err(SyncError::not_found(format!("{}/{}", collection, id))),
    }
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), SyncError> {
    self.check("delete", collection, Some(id)).await?;
    let removed = self
      .collections
      .lock()
      .get_mut(collection)
      .and_then(|docs| docs.remove(id));
    match removed {
      Some(_) => Ok(()),
      None => Err(SyncError::not_found(format!("{}/{}", collection, id))),
    }
  }

  async fn query(
    &self,
    collection: &str,
    filter: &Filter,
    limit: Option<usize>,
  ) -> Result<Vec<RemoteDocument>, SyncError> {
    self.check("query", collection, None).await?;
    let collections = self.collections.lock();
    let docs = collections
      .get(collection)
      .map(|docs| {
        docs
          .iter()
          .filter(|(_, fields)| filter.matches(fields))
          .take(limit.unwrap_or(usize::MAX))
          .map(|(id, fields)| RemoteDocument {
            id: id.clone(),
            fields: fields.clone(),
          })
          .collect()
      })
      .unwrap_or_default();
    Ok(docs)
  }

  async fn create(&self, collection: &str, fields: Document) -> Result<String, SyncError> {
    self.check("create", collection, None).await?;
    let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    self
      .collections
      .lock()
      .entry(collection.to_string())
      .or_default()
      .insert(id.clone(), fields);
    Ok(id)
  }
}

#[derive(Default)]
pub struct FakeBlobs {
  objects: Mutex<BTreeMap<String, Vec<u8>>>,
  fail: Mutex<Option<SyncError>>,
  deleted: Mutex<Vec<String>>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

impl FakeBlobs {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn fail_with(&self, error: Option<SyncError>) {
    *self.fail.lock() = error;
  }

  pub fn object(&self, path: &str) -> Option<Vec<u8>> {
    self.objects.lock().get(path).cloned()
  }

  pub fn deleted(&self) -> Vec<String> {
    self.deleted.lock().clone()
  }

  /// Most uploads observed running at once.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn url_for(path: &str) -> String {
    format!("https://blobs.test/{}", path)
  }
}

#[async_trait]
impl BlobStore for FakeBlobs {
  async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, SyncError> {
    let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(running, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let fail = self.fail.lock().clone();
    if let Some(error) = fail {
      return Err(error);
    }
    self.objects.lock().insert(path.to_string(), bytes);
    Ok(Self::url_for(path))
  }

  async fn delete(&self, path: &str) -> Result<(), SyncError> {
    let fail = self.fail.lock().clone();
    if let Some(error) = fail {
      return Err(error);
    }
    self.deleted.lock().push(path.to_string());
    self.objects.lock().remove(path);
    Ok(())
  }
}
