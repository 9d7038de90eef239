//! Reconcilers that push local changes and pull authoritative state.
//!
//! Every reconciler follows the same write path: apply locally first, then
//! push if online, and queue (or record a pending replacement) when the push
//! cannot happen. Remote failures never escape; they end up in the
//! [`SyncOutcome`] of the next pass.

mod applications;
mod collection;
mod contact;
mod coordinator;
mod profile;
mod state;

pub use applications::{ApplicationSync, ApplyOutcome};
pub use collection::{CollectionSync, NewUpload, PendingUpload, UploadOutcome};
pub use contact::ContactReviewSync;
pub use coordinator::{ConnectivityWatch, Reconciler, SyncCoordinator};
pub use profile::ProfileSync;
pub use state::{PassGuard, SyncOutcome, SyncState, SyncStatus};

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::remote::{BlobStore, RemoteStore};
use crate::store::{BlobStaging, PendingQueue, QueuedOp, SqliteStore};

/// Everything a reconciler needs, shared by all of them.
#[derive(Clone)]
pub struct SyncContext {
  /// Signed-in user the reconcilers act for
  pub uid: String,
  pub store: Arc<SqliteStore>,
  pub remote: Arc<dyn RemoteStore>,
  pub blobs: Arc<dyn BlobStore>,
  pub connectivity: Arc<dyn ConnectivityMonitor>,
  pub staging: BlobStaging,
}

impl SyncContext {
  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Best-effort removal of a remote blob. Failures leave an orphan behind
  /// and are only logged.
  pub(crate) async fn delete_blob(&self, path: &str) {
    if let Err(e) = self.blobs.delete(path).await {
      warn!(path, error = %e, "Failed to delete remote blob");
    }
  }
}

/// Apply queued operations oldest first.
///
/// Each success is removed from the queue immediately, so a pass that is
/// dropped part-way loses no progress. After a failure, later operations
/// for the same entity are held back until the next pass.
pub(crate) async fn drain_queue<D, F, Fut>(
  queue: &PendingQueue<D>,
  outcome: &mut SyncOutcome,
  mut apply: F,
) -> Result<(), SyncError>
where
  D: Serialize + DeserializeOwned,
  F: FnMut(QueuedOp<D>) -> Fut,
  Fut: Future<Output = Result<(), SyncError>>,
{
  let pending = queue.list_pending()?;
  let mut held_back: HashSet<String> = HashSet::new();

  for queued in pending {
    let entity_id = queued.entity_id().to_string();
    if held_back.contains(&entity_id) {
      outcome.skipped += 1;
      continue;
    }

    let seq = queued.seq;
    match apply(queued).await {
      Ok(()) => {
        queue.remove_entries(&[seq])?;
        outcome.applied += 1;
      }
      Err(e) => {
        warn!(kind = queue.kind(), entity_id = %entity_id, seq, error = %e, "Queued operation failed");
        held_back.insert(entity_id);
        outcome.record_failure(e);
      }
    }
  }

  Ok(())
}

/// A delete of a document that is already gone has nothing left to do.
pub(crate) fn deleted_or_missing(result: Result<(), SyncError>) -> Result<(), SyncError> {
  match result {
    Err(e) if e.is_not_found() => Ok(()),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::SqliteStore;
  use std::sync::Arc;

  fn queue() -> PendingQueue<String> {
    PendingQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()), "note")
  }

  #[tokio::test]
  async fn test_partial_success_leaves_only_failures() {
    let queue = queue();
    for id in ["a", "b", "c"] {
      queue.enqueue_edit(id, id.to_string()).unwrap();
    }

    let mut outcome = SyncOutcome::default();
    drain_queue(&queue, &mut outcome, |op| async move {
      match op.entity_id() {
        "b" => Err(SyncError::transient("timeout")),
        _ => Ok(()),
      }
    })
    .await
    .unwrap();

    let left: Vec<String> = queue
      .list_pending()
      .unwrap()
      .iter()
      .map(|op| op.entity_id().to_string())
      .collect();
    assert_eq!(left, vec!["b"]);
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.failed, 1);
  }

  #[tokio::test]
  async fn test_failure_holds_back_later_ops_for_same_entity() {
    let queue = queue();
    queue.enqueue_edit("a", "first".to_string()).unwrap();
    queue.enqueue_edit("b", "other".to_string()).unwrap();
    queue.enqueue_edit("a", "second".to_string()).unwrap();

    let mut outcome = SyncOutcome::default();
    let mut attempted = Vec::new();
    drain_queue(&queue, &mut outcome, |op| {
      let edit = match &op.op {
        crate::store::PendingOp::Edit(edit) => edit.delta.clone(),
        crate::store::PendingOp::Delete(_) => String::new(),
      };
      attempted.push(edit.clone());
      async move {
        if edit == "first" {
          Err(SyncError::transient("reset"))
        } else {
          Ok(())
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(attempted, vec!["first", "other"]);
    assert_eq!(outcome.skipped, 1);
    let left: Vec<String> = queue
      .pending_edits()
      .unwrap()
      .into_iter()
      .map(|e| e.delta)
      .collect();
    assert_eq!(left, vec!["first", "second"]);
  }

  #[test]
  fn test_deleted_or_missing() {
    assert!(deleted_or_missing(Err(SyncError::not_found("x"))).is_ok());
    assert!(deleted_or_missing(Err(SyncError::Offline)).is_err());
  }
}
