//! Per-user lists backed by uploaded files: portfolio items and résumés.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::{
  deleted_or_missing, drain_queue, Reconciler, SyncContext, SyncOutcome, SyncState, SyncStatus,
};
use crate::error::SyncError;
use crate::models::{CollectionEntity, UploadedBlob};
use crate::remote::Filter;
use crate::store::{PendingOp, PendingQueue, QueuedOp, RecordStore, SnapshotStore};

/// A file the user picked for upload.
#[derive(Debug, Clone)]
pub struct NewUpload<M> {
  /// Generated from `meta` when absent
  pub file_name: Option<String>,
  pub bytes: Vec<u8>,
  pub meta: M,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome<E> {
  Uploaded(E),
  /// Staged locally; retried by the next sync pass
  Pending {
    upload_id: String,
    local_path: PathBuf,
  },
}

/// A staged file whose remote upload has not been confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload<M> {
  pub upload_id: String,
  pub file_name: String,
  pub local_path: PathBuf,
  pub remote_path: String,
  pub meta: M,
  pub created_at: DateTime<Utc>,
}

pub struct CollectionSync<E: CollectionEntity> {
  ctx: SyncContext,
  collection: String,
  uploads_kind: String,
  snapshot: SnapshotStore<Vec<E>>,
  queue: PendingQueue<E::Delta>,
  upload_permits: Arc<Semaphore>,
  pass: tokio::sync::Mutex<()>,
  status: SyncStatus,
}

impl<E: CollectionEntity> CollectionSync<E> {
  pub fn new(ctx: SyncContext, upload_concurrency: usize) -> Self {
    let snapshot = SnapshotStore::new(Arc::clone(&ctx.store), E::KIND, &ctx.uid);
    let queue = PendingQueue::new(Arc::clone(&ctx.store), E::KIND);
    let collection = format!("users/{}/{}", ctx.uid, E::COLLECTION);

    let sync = Self {
      collection,
      uploads_kind: format!("{}.uploads", E::KIND),
      snapshot,
      queue,
      upload_permits: Arc::new(Semaphore::new(upload_concurrency.max(1))),
      pass: tokio::sync::Mutex::new(()),
      status: SyncStatus::new(SyncState::Clean),
      ctx,
    };
    sync.status.set(sync.settled_state(false));
    sync
  }

  /// Remote collection path, `users/<uid>/<collection>`.
  pub fn collection(&self) -> &str {
    &self.collection
  }

  /// The local list. Unreadable local data reads as empty.
  pub fn items(&self) -> Vec<E> {
    match self.snapshot.load() {
      Ok(items) => items.unwrap_or_default(),
      Err(e) => {
        warn!(kind = E::KIND, error = %e, "Failed to load local list");
        Vec::new()
      }
    }
  }

  pub fn pending_uploads(&self) -> Vec<PendingUpload<E::Meta>> {
    match self.ctx.store.get(&self.uploads_kind, &self.ctx.uid) {
      Ok(uploads) => uploads.unwrap_or_default(),
      Err(e) => {
        warn!(kind = E::KIND, error = %e, "Failed to load pending uploads");
        Vec::new()
      }
    }
  }

  pub fn pending_ops(&self) -> Result<Vec<QueuedOp<E::Delta>>> {
    self.queue.list_pending()
  }

  pub fn state(&self) -> SyncState {
    self.status.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.status.subscribe()
  }

  /// Apply `delta` to item `id` locally, then push it or queue it.
  ///
  /// Older queued operations for the same item go first: the edit is queued
  /// behind them and a pass runs.
  pub async fn apply_edit(&self, id: &str, delta: E::Delta) -> Result<(), SyncError> {
    let online = self.ctx.is_online();
    self.status.local_write(|| -> Result<()> {
      self.snapshot.update(|items| {
        if let Some(item) = items.iter_mut().find(|item| item.id() == id) {
          item.apply(&delta);
        }
      })?;
      if !online {
        self.queue.enqueue_edit(id, delta.clone())?;
      }
      Ok(())
    })?;
    if !online {
      return Ok(());
    }

    let serial = self.pass.lock().await;
    if self.queue.has_entity(id)? {
      self.queue.enqueue_edit(id, delta)?;
      drop(serial);
      return self.replay_backlog(id).await;
    }

    match self
      .ctx
      .remote
      .update(&self.collection, id, E::delta_fields(&delta))
      .await
    {
      Ok(()) => {
        debug!(kind = E::KIND, id, "Pushed edit");
        self.settle_after_push()?;
      }
      Err(e) => {
        warn!(kind = E::KIND, id, error = %e, "Edit push failed, queueing");
        self.queue.enqueue_edit(id, delta)?;
      }
    }
    Ok(())
  }

  /// Remove item `id` locally, then delete it remotely (with its blob) or
  /// queue the delete.
  pub async fn delete(&self, id: &str, storage_path: Option<&str>) -> Result<(), SyncError> {
    let blob_path = storage_path.map(str::to_string);
    let online = self.ctx.is_online();
    self.status.local_write(|| -> Result<()> {
      self.snapshot.update(|items| items.retain(|item| item.id() != id))?;
      if !online {
        self.queue.enqueue_delete(id, blob_path.clone())?;
      }
      Ok(())
    })?;
    if !online {
      return Ok(());
    }

    let serial = self.pass.lock().await;
    if self.queue.has_entity(id)? {
      self.queue.enqueue_delete(id, blob_path)?;
      drop(serial);
      return self.replay_backlog(id).await;
    }

    match deleted_or_missing(self.ctx.remote.delete(&self.collection, id).await) {
      Ok(()) => {
        if let Some(path) = storage_path {
          self.ctx.delete_blob(path).await;
        }
        debug!(kind = E::KIND, id, "Deleted remotely");
        self.settle_after_push()?;
      }
      Err(e) => {
        warn!(kind = E::KIND, id, error = %e, "Delete failed, queueing");
        self.queue.enqueue_delete(id, blob_path)?;
      }
    }
    Ok(())
  }

  /// A write queued behind older operations is pushed by a pass. Failures
  /// stay queued and show up in the state.
  async fn replay_backlog(&self, id: &str) -> Result<(), SyncError> {
    debug!(kind = E::KIND, id, "Queued behind older operations");
    let outcome = self.sync_now().await;
    if let Some(e) = outcome.last_error {
      warn!(kind = E::KIND, id, error = %e, "Queued write not pushed yet");
    }
    Ok(())
  }

  /// Stage every file locally, then upload them with bounded concurrency.
  ///
  /// Staging errors are returned; upload failures are not, and leave the
  /// file pending for the next pass.
  pub async fn upload_all(
    &self,
    uploads: Vec<NewUpload<E::Meta>>,
  ) -> Result<Vec<UploadOutcome<E>>, SyncError> {
    let mut staged = Vec::with_capacity(uploads.len());
    for upload in uploads {
      staged.push(self.stage(upload).await?);
    }
    if staged.is_empty() {
      return Ok(Vec::new());
    }
    self.status.mark_local_write();

    let online = self.ctx.is_online();
    let _serial = if online {
      Some(self.pass.lock().await)
    } else {
      None
    };
    let results = join_all(staged.into_iter().map(|pending| async move {
      if !online {
        return UploadOutcome::Pending {
          upload_id: pending.upload_id,
          local_path: pending.local_path,
        };
      }
      match self.push_upload(&pending).await {
        Ok(entity) => UploadOutcome::Uploaded(entity),
        Err(e) => {
          warn!(
            kind = E::KIND,
            upload_id = %pending.upload_id,
            error = %e,
            "Upload failed, keeping staged file"
          );
          UploadOutcome::Pending {
            upload_id: pending.upload_id,
            local_path: pending.local_path,
          }
        }
      }
    }))
    .await;

    self.settle_after_push()?;
    Ok(results)
  }

  async fn stage(&self, upload: NewUpload<E::Meta>) -> Result<PendingUpload<E::Meta>, SyncError> {
    let file_name = upload
      .file_name
      .unwrap_or_else(|| E::default_file_name(&upload.meta));
    let upload_id = uuid::Uuid::new_v4().to_string();
    let local_path = self
      .ctx
      .staging
      .stage(E::KIND, &format!("{}_{}", upload_id, file_name), &upload.bytes)
      .await?;

    let pending = PendingUpload {
      remote_path: E::blob_path(&self.ctx.uid, &file_name, &upload.meta),
      upload_id,
      file_name,
      local_path,
      meta: upload.meta,
      created_at: Utc::now(),
    };
    self.ctx.store.update(
      &self.uploads_kind,
      &self.ctx.uid,
      |uploads: Option<Vec<PendingUpload<E::Meta>>>| {
        let mut uploads = uploads.unwrap_or_default();
        uploads.push(pending.clone());
        Some(uploads)
      },
    )?;
    Ok(pending)
  }

  /// Upload one staged file and create its document. On success the new
  /// entity joins the list and the staged file is dropped.
  async fn push_upload(&self, pending: &PendingUpload<E::Meta>) -> Result<E, SyncError> {
    let _permit = self
      .upload_permits
      .acquire()
      .await
      .map_err(|_| SyncError::Fatal("upload limiter closed".to_string()))?;

    let bytes = self.ctx.staging.read(&pending.local_path).await?;
    let size = bytes.len() as u64;
    let url = self.ctx.blobs.upload(&pending.remote_path, bytes).await?;

    let fields = E::upload_fields(&UploadedBlob {
      uid: &self.ctx.uid,
      file_name: &pending.file_name,
      url: &url,
      storage_path: &pending.remote_path,
      bytes: size,
      meta: &pending.meta,
    });
    let id = self.ctx.remote.create(&self.collection, fields.clone()).await?;
    let entity = E::from_document(&id, &fields)
      .ok_or_else(|| SyncError::Fatal(format!("uploaded {} document is incomplete", E::KIND)))?;

    self.status.local_write(|| -> Result<()> {
      self.snapshot.amend(|items| {
        items.retain(|item| item.id() != id);
        items.push(entity.clone());
      })?;
      self.forget_upload(&pending.upload_id)
    })?;
    if let Err(e) = self.ctx.staging.remove(&pending.local_path).await {
      warn!(kind = E::KIND, error = %e, "Failed to remove staged file");
    }

    info!(kind = E::KIND, id = %id, path = %pending.remote_path, "Uploaded file");
    Ok(entity)
  }

  fn forget_upload(&self, upload_id: &str) -> Result<()> {
    self.ctx.store.update(
      &self.uploads_kind,
      &self.ctx.uid,
      |uploads: Option<Vec<PendingUpload<E::Meta>>>| {
        let mut uploads = uploads.unwrap_or_default();
        uploads.retain(|u| u.upload_id != upload_id);
        (!uploads.is_empty()).then_some(uploads)
      },
    )?;
    Ok(())
  }

  /// Pull the authoritative list when online and nothing local is
  /// outstanding. Otherwise, or on failure, the local list is returned.
  pub async fn refresh(&self) -> Vec<E> {
    let dirty = self.snapshot.is_dirty().unwrap_or(true);
    if !self.ctx.is_online() || dirty || self.has_outstanding_ops() {
      return self.items();
    }
    match self.pull().await {
      Ok(Some(items)) => items,
      Ok(None) => self.items(),
      Err(e) => {
        warn!(kind = E::KIND, error = %e, "Refresh failed, using local list");
        self.items()
      }
    }
  }

  /// One reconciliation pass: drain queued edits and deletes, retry staged
  /// uploads, then pull the list if everything went through.
  pub async fn sync_now(&self) -> SyncOutcome {
    if !self.ctx.is_online() {
      return SyncOutcome::offline(self.state());
    }

    let _serial = self.pass.lock().await;
    let pass = self.status.begin(E::KIND);
    info!(kind = E::KIND, "Sync pass started");

    let mut outcome = SyncOutcome::default();
    if let Err(e) = self.run_pass(&mut outcome).await {
      outcome.record_failure(e);
    }

    outcome.state = self.settled_state(outcome.failed > 0);
    pass.finish(outcome.state);
    info!(
      kind = E::KIND,
      applied = outcome.applied,
      pushed = outcome.pushed,
      failed = outcome.failed,
      skipped = outcome.skipped,
      state = ?outcome.state,
      "Sync pass finished"
    );
    outcome
  }

  async fn run_pass(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
    drain_queue(&self.queue, outcome, |queued| self.apply_queued(queued)).await?;

    for pending in self.pending_uploads() {
      if !self.ctx.staging.exists(&pending.local_path).await {
        warn!(
          kind = E::KIND,
          upload_id = %pending.upload_id,
          "Staged file missing, dropping upload"
        );
        self.forget_upload(&pending.upload_id)?;
        continue;
      }
      match self.push_upload(&pending).await {
        Ok(_) => outcome.pushed += 1,
        Err(e) => outcome.record_failure(e),
      }
    }

    if outcome.failed == 0 && !self.has_outstanding_ops() {
      outcome.pulled = self.pull().await?.is_some();
    }
    Ok(())
  }

  async fn apply_queued(&self, queued: QueuedOp<E::Delta>) -> Result<(), SyncError> {
    match queued.op {
      PendingOp::Edit(edit) => {
        let fields = E::delta_fields(&edit.delta);
        match self
          .ctx
          .remote
          .update(&self.collection, &edit.entity_id, fields.clone())
          .await
        {
          Err(e) if e.is_not_found() => {
            debug!(kind = E::KIND, id = %edit.entity_id, "Document missing, merging edit");
            self
              .ctx
              .remote
              .set(&self.collection, &edit.entity_id, fields, true)
              .await
          }
          other => other,
        }
      }
      PendingOp::Delete(delete) => {
        deleted_or_missing(self.ctx.remote.delete(&self.collection, &delete.entity_id).await)?;
        if let Some(path) = &delete.blob_path {
          self.ctx.delete_blob(path).await;
        }
        Ok(())
      }
    }
  }

  /// Replace the local list with the remote one. Returns `None` and keeps
  /// the local list when a local write landed while fetching.
  async fn pull(&self) -> Result<Option<Vec<E>>, SyncError> {
    let seen = self.status.generation();
    let docs = self
      .ctx
      .remote
      .query(&self.collection, &Filter::new(), None)
      .await?;
    let items: Vec<E> = docs
      .iter()
      .filter_map(|doc| E::from_document(&doc.id, &doc.fields))
      .collect();

    let stored = self.status.if_unchanged(seen, || -> Result<bool> {
      if self.has_outstanding_ops() {
        return Ok(false);
      }
      self.snapshot.save(&items, false)?;
      Ok(true)
    });
    if stored.transpose()?.unwrap_or(false) {
      debug!(kind = E::KIND, count = items.len(), "Pulled list");
      Ok(Some(items))
    } else {
      debug!(kind = E::KIND, "Local write during pull, keeping local list");
      Ok(None)
    }
  }

  fn has_outstanding_ops(&self) -> bool {
    !self.queue.is_empty().unwrap_or(false) || !self.pending_uploads().is_empty()
  }

  /// After a direct push, the list is clean once nothing else is pending.
  fn settle_after_push(&self) -> Result<()> {
    self.status.without_writes(|| -> Result<()> {
      if !self.has_outstanding_ops() {
        self.snapshot.clear_dirty()?;
      }
      Ok(())
    })?;
    if !self.status.state().is_syncing() {
      self.status.set(self.settled_state(false));
    }
    Ok(())
  }

  fn settled_state(&self, failed: bool) -> SyncState {
    let dirty = self.snapshot.is_dirty().unwrap_or(true);
    let pending = self.queue.len().unwrap_or(0) + self.pending_uploads().len();
    SyncState::derive(dirty, pending, failed)
  }
}

#[async_trait]
impl<E: CollectionEntity> Reconciler for CollectionSync<E> {
  fn name(&self) -> &'static str {
    E::KIND
  }

  async fn sync_now(&self) -> SyncOutcome {
    CollectionSync::sync_now(self).await
  }

  fn state(&self) -> SyncState {
    CollectionSync::state(self)
  }
}
