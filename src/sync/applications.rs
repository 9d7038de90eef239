//! Applications of the signed-in user to other users' projects.
//!
//! Applications live in the `applications` array of the applicant's user
//! document. The remote store has no array append, so a push reads the
//! array and writes it back with the new entry; an entry already present
//! makes the push a no-op, which keeps replays idempotent.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{drain_queue, Reconciler, SyncContext, SyncOutcome, SyncState, SyncStatus};
use crate::error::SyncError;
use crate::models::ProjectApplication;
use crate::remote::Document;
use crate::store::{PendingOp, PendingQueue, QueuedOp, SnapshotStore};

const KIND: &str = "application";
const USERS: &str = "users";

/// What became of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
  Applied,
  AlreadyApplied,
  /// Stored locally; sent by the next sync pass
  Queued,
}

pub struct ApplicationSync {
  ctx: SyncContext,
  /// Project ids the remote has confirmed
  applied: SnapshotStore<Vec<String>>,
  queue: PendingQueue<ProjectApplication>,
  pass: tokio::sync::Mutex<()>,
  status: SyncStatus,
}

impl ApplicationSync {
  pub fn new(ctx: SyncContext) -> Self {
    let sync = Self {
      applied: SnapshotStore::new(Arc::clone(&ctx.store), KIND, &ctx.uid),
      queue: PendingQueue::new(Arc::clone(&ctx.store), KIND),
      pass: tokio::sync::Mutex::new(()),
      status: SyncStatus::new(SyncState::Clean),
      ctx,
    };
    sync.status.set(sync.settled_state(false));
    sync
  }

  pub fn state(&self) -> SyncState {
    self.status.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.status.subscribe()
  }

  /// Projects applied to, counting applications still queued.
  pub fn applied_project_ids(&self) -> BTreeSet<String> {
    let mut ids: BTreeSet<String> = match self.applied.load() {
      Ok(ids) => ids.unwrap_or_default().into_iter().collect(),
      Err(e) => {
        warn!(error = %e, "Failed to read applied projects");
        BTreeSet::new()
      }
    };
    match self.queue.list_pending() {
      Ok(ops) => ids.extend(ops.iter().map(|op| op.entity_id().to_string())),
      Err(e) => warn!(error = %e, "Failed to read queued applications"),
    }
    ids
  }

  /// Applications waiting to be sent, oldest first.
  pub fn pending_applications(&self) -> Result<Vec<ProjectApplication>> {
    Ok(
      self
        .queue
        .pending_edits()?
        .into_iter()
        .map(|edit| edit.delta)
        .collect(),
    )
  }

  /// Refresh the applied set from the user's document when reachable.
  pub async fn load_applied(&self) -> BTreeSet<String> {
    if self.ctx.is_online() {
      let seen = self.status.generation();
      match self.fetch_applied().await {
        Ok(ids) => {
          let stored = self.status.if_unchanged(seen, || self.applied.save(&ids, false));
          if let Some(Err(e)) = stored {
            warn!(error = %e, "Failed to store applied projects");
          }
        }
        Err(e) => warn!(error = %e, "Failed to load applied projects, using local copy"),
      }
    }
    self.applied_project_ids()
  }

  async fn fetch_applied(&self) -> Result<Vec<String>, SyncError> {
    let doc = self.ctx.remote.get(USERS, &self.ctx.uid).await?;
    Ok(
      doc
        .map(|doc| ProjectApplication::applied_ids(&doc))
        .unwrap_or_default(),
    )
  }

  /// Apply to a project. Offline, or when the remote cannot be reached,
  /// the application is queued.
  pub async fn apply(&self, application: ProjectApplication) -> Result<ApplyOutcome, SyncError> {
    if self.applied_project_ids().contains(&application.project_id) {
      return Ok(ApplyOutcome::AlreadyApplied);
    }
    if !self.ctx.is_online() {
      self.enqueue(application)?;
      return Ok(ApplyOutcome::Queued);
    }

    let _serial = self.pass.lock().await;
    match self.push(&application).await {
      Ok(sent) => {
        self.remember(&application.project_id)?;
        self.settle();
        if sent {
          info!(project_id = %application.project_id, "Applied to project");
          Ok(ApplyOutcome::Applied)
        } else {
          Ok(ApplyOutcome::AlreadyApplied)
        }
      }
      Err(e) => {
        warn!(project_id = %application.project_id, error = %e, "Application failed, queueing");
        self.enqueue(application)?;
        Ok(ApplyOutcome::Queued)
      }
    }
  }

  fn enqueue(&self, application: ProjectApplication) -> Result<()> {
    let project_id = application.project_id.clone();
    self
      .status
      .local_write(|| self.queue.enqueue_edit(&project_id, application))?;
    debug!(project_id = %project_id, "Queued application");
    Ok(())
  }

  fn remember(&self, project_id: &str) -> Result<()> {
    self.status.local_write(|| {
      self.applied.amend(|ids| {
        if !ids.iter().any(|id| id == project_id) {
          ids.push(project_id.to_string());
        }
      })
    })?;
    Ok(())
  }

  /// Append the application to the user's document. Returns false if it
  /// was already there.
  async fn push(&self, application: &ProjectApplication) -> Result<bool, SyncError> {
    let doc = self.ctx.remote.get(USERS, &self.ctx.uid).await?;
    let doc = doc.unwrap_or_default();
    if ProjectApplication::applied_ids(&doc).contains(&application.project_id) {
      return Ok(false);
    }

    let mut applications = doc
      .get("applications")
      .and_then(Value::as_array)
      .cloned()
      .unwrap_or_default();
    applications.push(application.to_value(Utc::now().timestamp_millis()));

    let mut fields = Document::new();
    fields.insert("applications".into(), Value::Array(applications));
    self.ctx.remote.set(USERS, &self.ctx.uid, fields, true).await?;
    Ok(true)
  }

  /// Send queued applications, then reload the applied set.
  pub async fn sync_now(&self) -> SyncOutcome {
    if !self.ctx.is_online() {
      return SyncOutcome::offline(self.state());
    }

    let _serial = self.pass.lock().await;
    let pass = self.status.begin(KIND);

    let mut outcome = SyncOutcome::default();
    if let Err(e) = self.run_pass(&mut outcome).await {
      outcome.record_failure(e);
    }

    outcome.state = self.settled_state(outcome.failed > 0);
    pass.finish(outcome.state);
    info!(
      kind = KIND,
      applied = outcome.applied,
      failed = outcome.failed,
      state = ?outcome.state,
      "Sync pass finished"
    );
    outcome
  }

  async fn run_pass(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
    drain_queue(&self.queue, outcome, |queued| self.apply_queued(queued)).await?;

    if outcome.failed == 0 {
      let seen = self.status.generation();
      let ids = self.fetch_applied().await?;
      let stored = self.status.if_unchanged(seen, || -> Result<bool> {
        if !self.queue.is_empty()? {
          return Ok(false);
        }
        self.applied.save(&ids, false)?;
        Ok(true)
      });
      outcome.pulled = stored.transpose()?.unwrap_or(false);
    }
    Ok(())
  }

  async fn apply_queued(&self, queued: QueuedOp<ProjectApplication>) -> Result<(), SyncError> {
    match queued.op {
      PendingOp::Edit(edit) => {
        if self.push(&edit.delta).await? {
          info!(
            project_id = %edit.entity_id,
            title = %edit.delta.project_title,
            "Sent queued application"
          );
        }
        self.remember(&edit.entity_id)?;
        Ok(())
      }
      PendingOp::Delete(_) => Ok(()),
    }
  }

  fn settle(&self) {
    if !self.status.state().is_syncing() {
      self.status.set(self.settled_state(false));
    }
  }

  fn settled_state(&self, failed: bool) -> SyncState {
    SyncState::derive(false, self.queue.len().unwrap_or(0), failed)
  }
}

#[async_trait]
impl Reconciler for ApplicationSync {
  fn name(&self) -> &'static str {
    KIND
  }

  async fn sync_now(&self) -> SyncOutcome {
    ApplicationSync::sync_now(self).await
  }

  fn state(&self) -> SyncState {
    ApplicationSync::state(self)
  }
}
