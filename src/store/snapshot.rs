//! Local copy of an entity with a dirty flag and a pending-replacement slot.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use super::sqlite::{RecordStore, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirtySnapshot<E> {
  entity: E,
  dirty: bool,
}

/// Durable snapshot of one entity of kind `kind`, scoped by `scope`
/// (usually the signed-in user's id).
///
/// The pending replacement is the latest full state the user intended
/// while a push was outstanding. It is independent of the snapshot and is
/// dropped by a clean save.
pub struct SnapshotStore<E> {
  store: Arc<SqliteStore>,
  kind: String,
  snapshot_key: String,
  replacement_key: String,
  _entity: PhantomData<fn() -> E>,
}

impl<E> SnapshotStore<E>
where
  E: Serialize + DeserializeOwned,
{
  pub fn new(store: Arc<SqliteStore>, kind: &str, scope: &str) -> Self {
    Self {
      store,
      kind: format!("{}.snapshot", kind),
      snapshot_key: scope.to_string(),
      replacement_key: format!("{}:replacement", scope),
      _entity: PhantomData,
    }
  }

  pub fn save(&self, entity: &E, dirty: bool) -> Result<()> {
    let record = DirtySnapshot { entity, dirty };
    self.store.transaction(|tx| {
      tx.set(&self.kind, &self.snapshot_key, &record)?;
      if !dirty {
        tx.remove(&self.kind, &self.replacement_key)?;
      }
      Ok(())
    })
  }

  pub fn load(&self) -> Result<Option<E>> {
    Ok(self.load_record()?.map(|record| record.entity))
  }

  fn load_record(&self) -> Result<Option<DirtySnapshot<E>>> {
    self.store.get(&self.kind, &self.snapshot_key)
  }

  pub fn is_dirty(&self) -> Result<bool> {
    Ok(self.load_record()?.is_some_and(|record| record.dirty))
  }

  pub fn mark_dirty(&self) -> Result<()> {
    self.set_dirty(true)
  }

  pub fn clear_dirty(&self) -> Result<()> {
    self.set_dirty(false)
  }

  fn set_dirty(&self, dirty: bool) -> Result<()> {
    self
      .store
      .update(&self.kind, &self.snapshot_key, |record: Option<DirtySnapshot<E>>| {
        record.map(|mut record| {
          record.dirty = dirty;
          record
        })
      })?;
    Ok(())
  }

  /// Apply `f` to the stored entity and mark it dirty, atomically.
  /// Returns the new entity, or `None` if nothing is stored.
  pub fn update(&self, f: impl FnOnce(&mut E)) -> Result<Option<E>> {
    let updated = self
      .store
      .update(&self.kind, &self.snapshot_key, |record: Option<DirtySnapshot<E>>| {
        record.map(|mut record| {
          f(&mut record.entity);
          record.dirty = true;
          record
        })
      })?;
    Ok(updated.map(|record| record.entity))
  }

  /// Apply a change the remote has already confirmed. The dirty flag is
  /// left as it was; a missing snapshot starts clean from the default.
  pub fn amend(&self, f: impl FnOnce(&mut E)) -> Result<E>
  where
    E: Default,
  {
    let updated = self
      .store
      .update(&self.kind, &self.snapshot_key, |record: Option<DirtySnapshot<E>>| {
        let mut record = record.unwrap_or(DirtySnapshot {
          entity: E::default(),
          dirty: false,
        });
        f(&mut record.entity);
        Some(record)
      })?;
    Ok(updated.map(|record| record.entity).unwrap_or_default())
  }

  /// Record `entity` as the latest intended full state. Also marks the
  /// snapshot dirty.
  pub fn save_pending_replacement(&self, entity: &E) -> Result<()> {
    self.store.transaction(|tx| {
      tx.set(&self.kind, &self.replacement_key, entity)?;
      if let Some(mut record) = tx.get::<DirtySnapshot<E>>(&self.kind, &self.snapshot_key)? {
        record.dirty = true;
        tx.set(&self.kind, &self.snapshot_key, &record)?;
      }
      Ok(())
    })
  }

  pub fn load_pending_replacement(&self) -> Result<Option<E>> {
    self.store.get(&self.kind, &self.replacement_key)
  }

  pub fn clear_pending_replacement(&self) -> Result<()> {
    self.store.remove(&self.kind, &self.replacement_key)
  }

  /// Apply `f` to the pending replacement, if one exists.
  pub fn update_pending_replacement(&self, f: impl FnOnce(&mut E)) -> Result<()> {
    self
      .store
      .update(&self.kind, &self.replacement_key, |entity: Option<E>| {
        entity.map(|mut entity| {
          f(&mut entity);
          entity
        })
      })?;
    Ok(())
  }
}
