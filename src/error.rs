//! Error taxonomy for remote calls, fetches and local storage.
//!
//! Remote failures never escape a reconciler: they are folded into the
//! outcome of a sync pass and leave local state dirty or queued. Local
//! storage plumbing reports through `color_eyre::Result`; only decoding
//! failures of persisted records are classified as [`SyncError::LocalCorruption`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Connection dropped, timeout, 5xx. Safe to retry on the next trigger.
  #[error("Transient network error: {0}")]
  TransientNetwork(String),

  #[error("Authentication required: {0}")]
  Auth(String),

  /// Remote document missing. Pushes treat this as "create on next push".
  #[error("Remote entity not found: {0}")]
  NotFound(String),

  #[error("Local data corrupted: {0}")]
  LocalCorruption(String),

  /// Remote rejected the request for a reason that retrying will not fix.
  #[error("Remote error: {0}")]
  Fatal(String),

  #[error("No validated connectivity")]
  Offline,
}

impl SyncError {
  pub fn transient(msg: impl Into<String>) -> Self {
    SyncError::TransientNetwork(msg.into())
  }

  pub fn not_found(msg: impl Into<String>) -> Self {
    SyncError::NotFound(msg.into())
  }

  /// Whether the next connectivity transition or manual sync may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::TransientNetwork(_) | SyncError::Offline)
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, SyncError::NotFound(_))
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, SyncError::Auth(_))
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(err: rusqlite::Error) -> Self {
    SyncError::LocalCorruption(err.to_string())
  }
}

impl From<color_eyre::Report> for SyncError {
  fn from(err: color_eyre::Report) -> Self {
    SyncError::LocalCorruption(format!("{:#}", err))
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    SyncError::LocalCorruption(err.to_string())
  }
}

/// Failure observed by every caller attached to one coalesced fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error(transparent)]
  Upstream(#[from] SyncError),

  /// The fetch task panicked or was cancelled before it settled.
  #[error("Fetch aborted before completion")]
  Aborted,
}

impl FetchError {
  pub fn upstream(&self) -> Option<&SyncError> {
    match self {
      FetchError::Upstream(e) => Some(e),
      FetchError::Aborted => None,
    }
  }
}
