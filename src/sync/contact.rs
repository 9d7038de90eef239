//! Contact requests and their "reviewed" marks.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{drain_queue, Reconciler, SyncContext, SyncOutcome, SyncState, SyncStatus};
use crate::error::SyncError;
use crate::models::{ContactInbox, ContactRequest, ReviewDelta};
use crate::remote::{Filter, RemoteDocument};
use crate::store::{PendingOp, PendingQueue, QueuedOp, SnapshotStore};

const KIND: &str = "contact";
const CONTACT_REQUESTS: &str = "contactRequests";

pub struct ContactReviewSync {
  ctx: SyncContext,
  snapshot: SnapshotStore<ContactInbox>,
  queue: PendingQueue<ReviewDelta>,
  pass: tokio::sync::Mutex<()>,
  status: SyncStatus,
}

impl ContactReviewSync {
  pub fn new(ctx: SyncContext) -> Self {
    let sync = Self {
      snapshot: SnapshotStore::new(Arc::clone(&ctx.store), KIND, &ctx.uid),
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

  /// Received and sent requests, newest first. Served from the server when
  /// reachable, else from the local copy; queued reviews are shown as done
  /// either way.
  pub async fn load_requests(&self) -> ContactInbox {
    if self.ctx.is_online() {
      let seen = self.status.generation();
      match self.fetch_inbox().await {
        Ok(inbox) => {
          let stored = self.status.if_unchanged(seen, || {
            let inbox = self.with_pending_reviews(inbox);
            let dirty = !self.queue.is_empty().unwrap_or(true);
            if let Err(e) = self.snapshot.save(&inbox, dirty) {
              warn!(error = %e, "Failed to store contact requests");
            }
            inbox
          });
          if let Some(inbox) = stored {
            return inbox;
          }
          debug!("Review marked while loading, using local copy");
        }
        Err(e) => warn!(error = %e, "Failed to load contact requests, using local copy"),
      }
    }

    let local = match self.snapshot.load() {
      Ok(inbox) => inbox.unwrap_or_default(),
      Err(e) => {
        warn!(error = %e, "Failed to read local contact requests");
        ContactInbox::default()
      }
    };
    self.with_pending_reviews(local)
  }

  async fn fetch_inbox(&self) -> Result<ContactInbox, SyncError> {
    let received = self
      .ctx
      .remote
      .query(CONTACT_REQUESTS, &Filter::new().eq("toUid", self.ctx.uid.as_str()), None)
      .await?;
    let sent = self
      .ctx
      .remote
      .query(CONTACT_REQUESTS, &Filter::new().eq("fromUid", self.ctx.uid.as_str()), None)
      .await?;

    let decode = |docs: Vec<RemoteDocument>| {
      let mut requests: Vec<ContactRequest> = docs
        .iter()
        .filter_map(|doc| ContactRequest::from_document(&doc.id, &doc.fields))
        .collect();
      requests.sort_by(|a, b| b.contact_request_time.cmp(&a.contact_request_time));
      requests
    };

    Ok(ContactInbox {
      received: decode(received),
      sent: decode(sent),
    })
  }

  fn with_pending_reviews(&self, mut inbox: ContactInbox) -> ContactInbox {
    match self.queue.pending_edits() {
      Ok(edits) => {
        for edit in edits {
          inbox.mark_reviewed(&edit.entity_id, edit.delta.review_time);
        }
      }
      Err(e) => warn!(error = %e, "Failed to read queued reviews"),
    }
    inbox
  }

  /// Mark a received request reviewed, locally first. A review of a
  /// request that still has one queued is queued behind it.
  pub async fn mark_reviewed(&self, request_id: &str) -> Result<(), SyncError> {
    let delta = ReviewDelta {
      review_time: Utc::now().timestamp_millis(),
    };
    let online = self.ctx.is_online();
    self.status.local_write(|| -> Result<()> {
      self.snapshot.update(|inbox| {
        inbox.mark_reviewed(request_id, delta.review_time);
      })?;
      if !online {
        self.queue.enqueue_edit(request_id, delta)?;
      }
      Ok(())
    })?;
    if !online {
      return Ok(());
    }

    let serial = self.pass.lock().await;
    if self.queue.has_entity(request_id)? {
      self.queue.enqueue_edit(request_id, delta)?;
      drop(serial);
      debug!(request_id, "Queued review behind an older one");
      let outcome = self.sync_now().await;
      if let Some(e) = outcome.last_error {
        warn!(request_id, error = %e, "Queued review not pushed yet");
      }
      return Ok(());
    }

    match self.push_review(request_id, &delta).await {
      Ok(()) => {
        self.status.without_writes(|| -> Result<()> {
          if self.queue.is_empty()? {
            self.snapshot.clear_dirty()?;
          }
          Ok(())
        })?;
        if !self.status.state().is_syncing() {
          self.status.set(self.settled_state(false));
        }
      }
      Err(e) => {
        warn!(request_id, error = %e, "Review push failed, queueing");
        self.queue.enqueue_edit(request_id, delta)?;
      }
    }
    Ok(())
  }

  /// A request deleted remotely has nothing left to review.
  async fn push_review(&self, request_id: &str, delta: &ReviewDelta) -> Result<(), SyncError> {
    match self
      .ctx
      .remote
      .update(CONTACT_REQUESTS, request_id, delta.to_document())
      .await
    {
      Err(e) if e.is_not_found() => {
        info!(request_id, "Contact request gone, dropping review");
        Ok(())
      }
      other => other,
    }
  }

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
      let inbox = self.fetch_inbox().await?;
      let stored = self.status.if_unchanged(seen, || -> Result<bool> {
        if !self.queue.is_empty()? {
          return Ok(false);
        }
        self.snapshot.save(&inbox, false)?;
        Ok(true)
      });
      outcome.pulled = stored.transpose()?.unwrap_or(false);
      if outcome.pulled {
        debug!(
          received = inbox.received.len(),
          sent = inbox.sent.len(),
          "Reloaded contact requests"
        );
      }
    }
    Ok(())
  }

  async fn apply_queued(&self, queued: QueuedOp<ReviewDelta>) -> Result<(), SyncError> {
    match queued.op {
      PendingOp::Edit(edit) => self.push_review(&edit.entity_id, &edit.delta).await,
      PendingOp::Delete(_) => Ok(()),
    }
  }

  fn settled_state(&self, failed: bool) -> SyncState {
    SyncState::derive(
      self.snapshot.is_dirty().unwrap_or(true),
      self.queue.len().unwrap_or(0),
      failed,
    )
  }
}

#[async_trait]
impl Reconciler for ContactReviewSync {
  fn name(&self) -> &'static str {
    KIND
  }

  async fn sync_now(&self) -> SyncOutcome {
    ContactReviewSync::sync_now(self).await
  }

  fn state(&self) -> SyncState {
    ContactReviewSync::state(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::TestBed;
  use serde_json::json;
  use std::time::Duration;

  fn seed(bed: &TestBed) {
    bed.remote.insert(
      CONTACT_REQUESTS,
      "r1",
      json!({ "fromUid": "u2", "toUid": "u1", "fromName": "Bo", "contactRequestTime": 10 }),
    );
    bed.remote.insert(
      CONTACT_REQUESTS,
      "r2",
      json!({ "fromUid": "u3", "toUid": "u1", "contactRequestTime": 20 }),
    );
    bed.remote.insert(
      CONTACT_REQUESTS,
      "s1",
      json!({ "fromUid": "u1", "toUid": "u4", "contactRequestTime": 5 }),
    );
  }

  #[tokio::test]
  async fn test_load_splits_and_caches() {
    let bed = TestBed::new("u1", true);
    seed(&bed);
    let sync = ContactReviewSync::new(bed.ctx.clone());

    let inbox = sync.load_requests().await;
    let received: Vec<&str> = inbox.received.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(received, vec!["r2", "r1"]);
    assert_eq!(inbox.sent.len(), 1);

    bed.net.set_online(false);
    assert_eq!(sync.load_requests().await, inbox);
  }

  #[tokio::test]
  async fn test_offline_review_is_visible_and_replayed() {
    let bed = TestBed::new("u1", true);
    seed(&bed);
    let sync = ContactReviewSync::new(bed.ctx.clone());
    sync.load_requests().await;

    bed.net.set_online(false);
    sync.mark_reviewed("r1").await.unwrap();
    let inbox = sync.load_requests().await;
    let r1 = inbox.received.iter().find(|r| r.id == "r1").unwrap();
    assert!(r1.reviewed);
    assert_eq!(sync.state(), SyncState::Dirty);

    bed.net.set_online(true);
    let outcome = sync.sync_now().await;
    assert!(outcome.is_success());
    assert!(outcome.pulled);
    assert_eq!(
      bed.remote.doc(CONTACT_REQUESTS, "r1").unwrap()["reviewed"],
      json!(true)
    );
    assert_eq!(sync.state(), SyncState::Clean);
  }

  #[tokio::test]
  async fn test_review_of_deleted_request_is_dropped() {
    let bed = TestBed::new("u1", false);
    let sync = ContactReviewSync::new(bed.ctx.clone());
    sync.mark_reviewed("gone").await.unwrap();

    bed.net.set_online(true);
    let outcome = sync.sync_now().await;
    assert_eq!(outcome.applied, 1);
    assert!(sync.queue.is_empty().unwrap());
    assert!(bed.remote.doc(CONTACT_REQUESTS, "gone").is_none());
  }

  #[tokio::test]
  async fn test_failed_review_push_is_queued() {
    let bed = TestBed::new("u1", true);
    seed(&bed);
    let sync = ContactReviewSync::new(bed.ctx.clone());
    bed
      .remote
      .fail("update", CONTACT_REQUESTS, None, SyncError::transient("503"));

    sync.mark_reviewed("r2").await.unwrap();
    assert_eq!(sync.queue.len().unwrap(), 1);

    let outcome = sync.sync_now().await;
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.state, SyncState::Error);
    assert_eq!(sync.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_online_review_goes_behind_queued_review() {
    let bed = TestBed::new("u1", true);
    seed(&bed);
    let sync = ContactReviewSync::new(bed.ctx.clone());
    sync.load_requests().await;

    bed.net.set_online(false);
    sync.mark_reviewed("r1").await.unwrap();
    let first = sync.queue.pending_edits().unwrap()[0].delta.review_time;

    tokio::time::sleep(Duration::from_millis(5)).await;
    bed.net.set_online(true);
    sync.mark_reviewed("r1").await.unwrap();

    assert!(sync.queue.is_empty().unwrap());
    assert_eq!(bed.remote.count("update"), 2);
    let remote_time = bed.remote.doc(CONTACT_REQUESTS, "r1").unwrap()["reviewTime"]
      .as_i64()
      .unwrap();
    assert!(remote_time > first);
    assert_eq!(sync.state(), SyncState::Clean);
  }

  #[tokio::test]
  async fn test_review_during_reload_is_kept() {
    let bed = TestBed::new("u1", true);
    seed(&bed);
    let sync = ContactReviewSync::new(bed.ctx.clone());
    sync.load_requests().await;

    let gate = bed.remote.pause("query", CONTACT_REQUESTS, None);
    let (outcome, _) = tokio::join!(sync.sync_now(), async {
      gate.reached().await;
      bed.net.set_online(false);
      sync.mark_reviewed("r2").await.unwrap();
      gate.release();
    });

    assert!(!outcome.pulled);
    assert_eq!(outcome.state, SyncState::Dirty);
    let local = sync.snapshot.load().unwrap().unwrap();
    assert!(local.received.iter().any(|r| r.id == "r2" && r.reviewed));
  }
}
