//! Reconciliation state, published to observers.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::error::SyncError;

/// Where an entity kind stands relative to the remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
  /// No dirty flag, nothing queued
  #[default]
  Clean,
  /// Local changes not yet confirmed remotely
  Dirty,
  /// A reconciliation pass is running
  Syncing,
  /// The last pass failed; local changes are kept for retry
  Error,
}

impl SyncState {
  /// State after a pass (or a local write), from what is still outstanding.
  pub fn derive(dirty: bool, pending: usize, failed: bool) -> Self {
    if failed {
      SyncState::Error
    } else if dirty || pending > 0 {
      SyncState::Dirty
    } else {
      SyncState::Clean
    }
  }

  pub fn is_clean(&self) -> bool {
    matches!(self, SyncState::Clean)
  }

  pub fn is_syncing(&self) -> bool {
    matches!(self, SyncState::Syncing)
  }

  /// Whether local changes are waiting for a pass.
  pub fn has_pending_changes(&self) -> bool {
    matches!(self, SyncState::Dirty | SyncState::Error)
  }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
  /// Snapshots and replacements pushed
  pub pushed: usize,
  /// Queued operations applied and removed
  pub applied: usize,
  pub failed: usize,
  /// Queued operations held back because an earlier one for the same
  /// entity failed
  pub skipped: usize,
  /// Authoritative state pulled back after a clean pass
  pub pulled: bool,
  pub state: SyncState,
  pub last_error: Option<SyncError>,
}

impl SyncOutcome {
  /// A pass that did not start because the remote is unreachable.
  pub fn offline(state: SyncState) -> Self {
    Self {
      state,
      last_error: Some(SyncError::Offline),
      ..Self::default()
    }
  }

  pub fn record_failure(&mut self, error: SyncError) {
    self.failed += 1;
    self.last_error = Some(error);
  }

  pub fn is_success(&self) -> bool {
    self.failed == 0 && self.last_error.is_none()
  }
}

/// Current [`SyncState`] of one reconciler, observable through a watch
/// channel.
///
/// Also counts local writes. A pull remembers the count before it fetches
/// and only stores what it fetched if no write happened in between.
#[derive(Debug)]
pub struct SyncStatus {
  tx: watch::Sender<SyncState>,
  writes: Mutex<u64>,
}

impl SyncStatus {
  pub fn new(initial: SyncState) -> Self {
    let (tx, _) = watch::channel(initial);
    Self {
      tx,
      writes: Mutex::new(0),
    }
  }

  pub fn state(&self) -> SyncState {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.tx.subscribe()
  }

  pub fn set(&self, state: SyncState) {
    self.tx.send_if_modified(|current| {
      let changed = *current != state;
      *current = state;
      changed
    });
  }

  /// Apply a local write through `f` and record it. Pulls that fetched
  /// before the write will not store their result over it.
  pub(crate) fn local_write<R>(&self, f: impl FnOnce() -> R) -> R {
    let mut writes = self.writes.lock();
    *writes += 1;
    let result = f();
    drop(writes);
    self.mark_local_write();
    result
  }

  /// Record a local write in the published state. A running pass keeps
  /// its Syncing state and picks the change up when it finishes.
  pub fn mark_local_write(&self) {
    self.tx.send_if_modified(|current| {
      if matches!(current, SyncState::Syncing | SyncState::Dirty) {
        return false;
      }
      *current = SyncState::Dirty;
      true
    });
  }

  /// Local writes recorded so far.
  pub fn generation(&self) -> u64 {
    *self.writes.lock()
  }

  /// Run `f` only if no local write was recorded since `seen`. Writes wait
  /// for `f` to finish, so `f` never interleaves with one.
  pub(crate) fn if_unchanged<R>(&self, seen: u64, f: impl FnOnce() -> R) -> Option<R> {
    let writes = self.writes.lock();
    if *writes != seen {
      return None;
    }
    let result = f();
    drop(writes);
    Some(result)
  }

  /// Run `f` with local writes held off.
  pub(crate) fn without_writes<R>(&self, f: impl FnOnce() -> R) -> R {
    let _writes = self.writes.lock();
    f()
  }

  /// Enter Syncing. Dropping the guard without [`PassGuard::finish`]
  /// means the pass was abandoned and leaves the state Dirty.
  pub fn begin(&self, kind: &'static str) -> PassGuard<'_> {
    self.set(SyncState::Syncing);
    PassGuard {
      status: self,
      kind,
      finished: false,
    }
  }
}

pub struct PassGuard<'a> {
  status: &'a SyncStatus,
  kind: &'static str,
  finished: bool,
}

impl PassGuard<'_> {
  pub fn finish(mut self, state: SyncState) {
    self.finished = true;
    self.status.set(state);
  }
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    if !self.finished {
      info!(kind = self.kind, "Sync pass abandoned");
      self.status.set(SyncState::Dirty);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_derive() {
    assert_eq!(SyncState::derive(false, 0, false), SyncState::Clean);
    assert_eq!(SyncState::derive(true, 0, false), SyncState::Dirty);
    assert_eq!(SyncState::derive(false, 2, false), SyncState::Dirty);
    assert_eq!(SyncState::derive(false, 0, true), SyncState::Error);
    assert!(SyncState::Error.has_pending_changes());
  }

  #[test]
  fn test_abandoned_pass_leaves_dirty() {
    let status = SyncStatus::new(SyncState::Dirty);
    {
      let _pass = status.begin("profile");
      assert!(status.state().is_syncing());
    }
    assert_eq!(status.state(), SyncState::Dirty);

    status.begin("profile").finish(SyncState::Clean);
    assert_eq!(status.state(), SyncState::Clean);
  }

  #[test]
  fn test_local_write_during_pass_keeps_syncing() {
    let status = SyncStatus::new(SyncState::Clean);
    status.mark_local_write();
    assert_eq!(status.state(), SyncState::Dirty);

    let pass = status.begin("resume");
    status.mark_local_write();
    assert_eq!(status.state(), SyncState::Syncing);
    pass.finish(SyncState::Dirty);
  }

  #[test]
  fn test_write_between_fetch_and_store_wins() {
    let status = SyncStatus::new(SyncState::Clean);
    let seen = status.generation();
    assert_eq!(status.if_unchanged(seen, || "stored"), Some("stored"));

    let written = status.local_write(|| 7);
    assert_eq!(written, 7);
    assert_eq!(status.state(), SyncState::Dirty);
    assert_eq!(status.if_unchanged(seen, || "stored"), None);
    assert_eq!(status.if_unchanged(status.generation(), || 1), Some(1));
  }

  #[tokio::test]
  async fn test_subscribers_observe_changes() {
    let status = SyncStatus::new(SyncState::Clean);
    let mut rx = status.subscribe();
    status.set(SyncState::Error);
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), SyncState::Error);
  }
}
