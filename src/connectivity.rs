//! Reachability signal supplied by the host.

use tokio::sync::watch;
use tracing::info;

/// Live boolean reachability. `true` means validated internet access, not
/// just an associated link.
pub trait ConnectivityMonitor: Send + Sync {
  fn observe(&self) -> watch::Receiver<bool>;

  fn is_online(&self) -> bool {
    *self.observe().borrow()
  }
}

/// Monitor driven by the host, e.g. from platform network callbacks.
#[derive(Debug)]
pub struct ManualConnectivity {
  tx: watch::Sender<bool>,
}

impl ManualConnectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx }
  }

  pub fn set_online(&self, online: bool) {
    let previous = self.tx.send_replace(online);
    if previous != online {
      info!(online, "Connectivity changed");
    }
  }
}

impl ConnectivityMonitor for ManualConnectivity {
  fn observe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  fn is_online(&self) -> bool {
    *self.tx.borrow()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_observers_see_transitions() {
    let monitor = ManualConnectivity::new(false);
    let mut rx = monitor.observe();
    assert!(!monitor.is_online());

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(monitor.is_online());
  }
}
