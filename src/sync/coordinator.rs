//! Runs every reconciler, on demand or when connectivity comes back.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SyncOutcome, SyncState};

/// One entity kind's reconciliation, as seen by the coordinator.
#[async_trait]
pub trait Reconciler: Send + Sync {
  fn name(&self) -> &'static str;

  /// Run one pass. Remote failures are reported in the outcome, never
  /// returned.
  async fn sync_now(&self) -> SyncOutcome;

  fn state(&self) -> SyncState;
}

#[derive(Default)]
pub struct SyncCoordinator {
  reconcilers: Vec<Arc<dyn Reconciler>>,
}

impl SyncCoordinator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) {
    self.reconcilers.push(reconciler);
  }

  pub fn states(&self) -> Vec<(&'static str, SyncState)> {
    self
      .reconcilers
      .iter()
      .map(|r| (r.name(), r.state()))
      .collect()
  }

  /// Run every reconciler concurrently. Outcomes come back in
  /// registration order.
  pub async fn sync_all(&self) -> Vec<(&'static str, SyncOutcome)> {
    let outcomes = join_all(self.reconcilers.iter().map(|r| async move {
      let outcome = r.sync_now().await;
      (r.name(), outcome)
    }))
    .await;

    for (name, outcome) in &outcomes {
      if let Some(error) = &outcome.last_error {
        warn!(kind = *name, failed = outcome.failed, error = %error, "Sync pass incomplete");
      }
    }
    outcomes
  }

  /// Sync whenever `online` flips from false to true. A pass still running
  /// when connectivity drops again is abandoned; whatever it did not finish
  /// stays dirty or queued for the next transition.
  ///
  /// The task ends when the sender side of `online` is dropped, or when the
  /// returned [`ConnectivityWatch`] is shut down or dropped.
  pub fn spawn_connectivity_watch(
    self: Arc<Self>,
    mut online: watch::Receiver<bool>,
  ) -> ConnectivityWatch {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
      let mut was_online = *online.borrow_and_update();
      debug!(online = was_online, "Connectivity watch started");

      loop {
        tokio::select! {
          _ = &mut shutdown_rx => break,
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            let now_online = *online.borrow_and_update();
            let regained = now_online && !was_online;
            was_online = now_online;
            if !regained {
              continue;
            }

            info!("Connectivity regained, syncing");
            tokio::select! {
              outcomes = self.sync_all() => {
                let failed: usize = outcomes.iter().map(|(_, o)| o.failed).sum();
                info!(kinds = outcomes.len(), failed, "Sync after reconnect finished");
              }
              _ = wait_offline(&mut online) => {
                info!("Connectivity lost, abandoning sync pass");
                was_online = false;
              }
              _ = &mut shutdown_rx => break,
            }
          }
        }
      }

      debug!("Connectivity watch stopped");
    });

    ConnectivityWatch {
      handle,
      shutdown: Some(shutdown_tx),
    }
  }
}

/// Resolves once `online` reads false. Never resolves if the sender is gone.
async fn wait_offline(online: &mut watch::Receiver<bool>) {
  if online.wait_for(|online| !*online).await.is_err() {
    std::future::pending::<()>().await;
  }
}

/// Handle to the task started by [`SyncCoordinator::spawn_connectivity_watch`].
pub struct ConnectivityWatch {
  handle: JoinHandle<()>,
  shutdown: Option<oneshot::Sender<()>>,
}

impl ConnectivityWatch {
  /// Stop watching, abandoning any running pass, and wait for the task.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Err(e) = (&mut self.handle).await {
      warn!(error = %e, "Connectivity watch task failed");
    }
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }
}
