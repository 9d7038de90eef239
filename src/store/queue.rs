//! Durable FIFO of edits and deletes awaiting remote application.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::sqlite::{decode_envelope, encode_envelope, SqliteStore};
use crate::error::SyncError;

const OP_EDIT: &str = "edit";
const OP_DELETE: &str = "delete";

/// A sparse field change. Only the `Some` fields of `delta` were changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit<D> {
  pub entity_id: String,
  pub delta: D,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelete {
  pub entity_id: String,
  /// Remote blob to delete along with the document
  pub blob_path: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp<D> {
  Edit(PendingEdit<D>),
  Delete(PendingDelete),
}

/// A queued operation with its durable position.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOp<D> {
  pub seq: i64,
  pub op: PendingOp<D>,
}

impl<D> QueuedOp<D> {
  pub fn entity_id(&self) -> &str {
    match &self.op {
      PendingOp::Edit(edit) => &edit.entity_id,
      PendingOp::Delete(delete) => &delete.entity_id,
    }
  }
}

/// Pending operations of one entity kind.
///
/// Every mutation commits before returning. Operations for the same entity
/// are never merged; they replay in arrival order.
pub struct PendingQueue<D> {
  store: Arc<SqliteStore>,
  kind: &'static str,
  _delta: PhantomData<fn() -> D>,
}

impl<D> PendingQueue<D>
where
  D: Serialize + DeserializeOwned,
{
  pub fn new(store: Arc<SqliteStore>, kind: &'static str) -> Self {
    Self {
      store,
      kind,
      _delta: PhantomData,
    }
  }

  pub fn kind(&self) -> &'static str {
    self.kind
  }

  pub fn enqueue_edit(&self, entity_id: &str, delta: D) -> Result<i64> {
    let edit = PendingEdit {
      entity_id: entity_id.to_string(),
      delta,
      created_at: Utc::now(),
    };
    self.push(OP_EDIT, entity_id, &edit, edit.created_at)
  }

  pub fn enqueue_delete(&self, entity_id: &str, blob_path: Option<String>) -> Result<i64> {
    let delete = PendingDelete {
      entity_id: entity_id.to_string(),
      blob_path,
      created_at: Utc::now(),
    };
    self.push(OP_DELETE, entity_id, &delete, delete.created_at)
  }

  fn push<T: Serialize>(
    &self,
    op: &str,
    entity_id: &str,
    payload: &T,
    created_at: DateTime<Utc>,
  ) -> Result<i64> {
    let envelope = encode_envelope(self.kind, payload)?;
    let seq = self.store.transaction(|tx| {
      tx.conn()
        .execute(
          "INSERT INTO pending_ops (kind, op, entity_id, payload, created_at)
           VALUES (?, ?, ?, ?, ?)",
          params![self.kind, op, entity_id, envelope, created_at.to_rfc3339()],
        )
        .map_err(|e| eyre!("Failed to enqueue {} {}: {}", self.kind, op, e))?;
      Ok(tx.conn().last_insert_rowid())
    })?;

    debug!(kind = self.kind, op, entity_id, seq, "Queued pending operation");
    Ok(seq)
  }

  /// All pending operations, oldest first. Rows that fail to decode can
  /// never be replayed; they are logged and deleted so they do not keep
  /// the kind dirty.
  pub fn list_pending(&self) -> Result<Vec<QueuedOp<D>>> {
    let rows: Vec<(i64, String, String)> = self.store.read(|tx| {
      let mut stmt = tx
        .conn()
        .prepare("SELECT seq, op, payload FROM pending_ops WHERE kind = ? ORDER BY seq")
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

      let rows = stmt
        .query_map(params![self.kind], |row| {
          Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(|e| eyre!("Failed to read {} queue: {}", self.kind, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read {} queue row: {}", self.kind, e))?;
      Ok(rows)
    })?;

    let mut ops = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for (seq, op, payload) in rows {
      let decoded = match op.as_str() {
        OP_EDIT => decode_envelope(self.kind, &payload).map(PendingOp::Edit),
        OP_DELETE => decode_envelope(self.kind, &payload).map(PendingOp::Delete),
        other => Err(SyncError::LocalCorruption(format!(
          "unknown operation '{}'",
          other
        ))),
      };
      match decoded {
        Ok(op) => ops.push(QueuedOp { seq, op }),
        Err(e) => {
          warn!(kind = self.kind, seq, error = %e, "Dropping unreadable queued operation");
          unreadable.push(seq);
        }
      }
    }
    self.remove_entries(&unreadable)?;

    Ok(ops)
  }

  pub fn pending_edits(&self) -> Result<Vec<PendingEdit<D>>> {
    Ok(
      self
        .list_pending()?
        .into_iter()
        .filter_map(|queued| match queued.op {
          PendingOp::Edit(edit) => Some(edit),
          PendingOp::Delete(_) => None,
        })
        .collect(),
    )
  }

  pub fn pending_deletes(&self) -> Result<Vec<PendingDelete>> {
    Ok(
      self
        .list_pending()?
        .into_iter()
        .filter_map(|queued| match queued.op {
          PendingOp::Delete(delete) => Some(delete),
          PendingOp::Edit(_) => None,
        })
        .collect(),
    )
  }

  /// Number of replayable operations. Unreadable rows are purged first.
  pub fn len(&self) -> Result<usize> {
    Ok(self.list_pending()?.len())
  }

  /// Whether any operation for `entity_id` is still waiting.
  pub fn has_entity(&self, entity_id: &str) -> Result<bool> {
    Ok(
      self
        .list_pending()?
        .iter()
        .any(|queued| queued.entity_id() == entity_id),
    )
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn clear(&self) -> Result<()> {
    self.store.transaction(|tx| {
      tx.conn()
        .execute("DELETE FROM pending_ops WHERE kind = ?", params![self.kind])
        .map_err(|e| eyre!("Failed to clear {} queue: {}", self.kind, e))?;
      Ok(())
    })
  }

  /// Remove every operation whose entity id is in `entity_ids`.
  ///
  /// Survivors keep their rows, so their relative order is untouched.
  pub fn remove_by_ids(&self, entity_ids: &HashSet<String>) -> Result<usize> {
    if entity_ids.is_empty() {
      return Ok(0);
    }
    self.store.transaction(|tx| {
      let mut removed = 0;
      for entity_id in entity_ids {
        removed += tx
          .conn()
          .execute(
            "DELETE FROM pending_ops WHERE kind = ? AND entity_id = ?",
            params![self.kind, entity_id],
          )
          .map_err(|e| eyre!("Failed to remove {} ops: {}", self.kind, e))?;
      }
      Ok(removed)
    })
  }

  /// Remove specific operations by sequence number.
  pub fn remove_entries(&self, seqs: &[i64]) -> Result<usize> {
    if seqs.is_empty() {
      return Ok(0);
    }
    self.store.transaction(|tx| {
      let mut removed = 0;
      for seq in seqs {
        removed += tx
          .conn()
          .execute(
            "DELETE FROM pending_ops WHERE kind = ? AND seq = ?",
            params![self.kind, seq],
          )
          .map_err(|e| eyre!("Failed to remove {} op {}: {}", self.kind, seq, e))?;
      }
      Ok(removed)
    })
  }
}
