//! The signed-in user's own profile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{drain_queue, Reconciler, SyncContext, SyncOutcome, SyncState, SyncStatus};
use crate::error::SyncError;
use crate::models::{NewProject, Profile, ProfileDelta, Project, Session};
use crate::store::{PendingOp, PendingQueue, QueuedOp, RecordStore, SnapshotStore};

const KIND: &str = "profile";
const AVATAR_KIND: &str = "profile.avatar";
const PROJECT_IMAGES_KIND: &str = "profile.project_images";
const USERS: &str = "users";

/// An avatar staged locally and not yet uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingAvatar {
  local_path: PathBuf,
  remote_path: String,
  created_at: DateTime<Utc>,
}

/// A project cover staged locally and not yet uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingProjectImage {
  project_id: String,
  local_path: PathBuf,
  remote_path: String,
  created_at: DateTime<Utc>,
}

pub struct ProfileSync {
  ctx: SyncContext,
  session: Session,
  memory: Mutex<Option<Profile>>,
  snapshot: SnapshotStore<Profile>,
  queue: PendingQueue<ProfileDelta>,
  pass: tokio::sync::Mutex<()>,
  status: SyncStatus,
}

impl ProfileSync {
  pub fn new(ctx: SyncContext, session: Session) -> Self {
    let sync = Self {
      snapshot: SnapshotStore::new(Arc::clone(&ctx.store), KIND, &ctx.uid),
      queue: PendingQueue::new(Arc::clone(&ctx.store), KIND),
      memory: Mutex::new(None),
      pass: tokio::sync::Mutex::new(()),
      status: SyncStatus::new(SyncState::Clean),
      session,
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

  /// The profile to display: memory, then the local snapshot, then the
  /// remote document, then a default built from the session. Never fails.
  pub async fn get_profile(&self) -> Profile {
    if let Some(profile) = self.cached_profile() {
      return self.with_local_media(profile);
    }

    if self.ctx.is_online() {
      let seen = self.status.generation();
      match self.ctx.remote.get(USERS, &self.ctx.uid).await {
        Ok(Some(doc)) => {
          let profile = Profile::from_document(&self.ctx.uid, &doc);
          let stored = self.status.if_unchanged(seen, || {
            if let Err(e) = self.snapshot.save(&profile, false) {
              warn!(error = %e, "Failed to store fetched profile");
            }
            *self.memory.lock() = Some(profile.clone());
          });
          if stored.is_none() {
            return self.with_local_media(self.local_profile());
          }
          return self.with_local_media(profile);
        }
        Ok(None) => debug!(uid = %self.ctx.uid, "No remote profile, using default"),
        Err(e) => warn!(error = %e, "Failed to fetch profile, using default"),
      }
    }

    self.with_local_media(Profile::new_default(&self.session))
  }

  fn cached_profile(&self) -> Option<Profile> {
    if let Some(profile) = self.memory.lock().clone() {
      return Some(profile);
    }
    match self.snapshot.load() {
      Ok(Some(profile)) => {
        *self.memory.lock() = Some(profile.clone());
        Some(profile)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, "Failed to load local profile");
        None
      }
    }
  }

  fn local_profile(&self) -> Profile {
    self
      .cached_profile()
      .unwrap_or_else(|| Profile::new_default(&self.session))
  }

  /// Staged files stand in for remote URLs that are still missing.
  fn with_local_media(&self, mut profile: Profile) -> Profile {
    if !profile.has_avatar() {
      if let Some(pending) = self.pending_avatar() {
        profile.avatar_url = Some(pending.local_path.display().to_string());
      }
    }
    for image in self.pending_project_images() {
      if let Some(project) = profile
        .projects
        .iter_mut()
        .find(|p| p.id == image.project_id && p.img_url.is_none())
      {
        project.img_url = Some(image.local_path.display().to_string());
      }
    }
    profile
  }

  fn pending_avatar(&self) -> Option<PendingAvatar> {
    match self.ctx.store.get(AVATAR_KIND, &self.ctx.uid) {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "Failed to read pending avatar");
        None
      }
    }
  }

  /// Replace the whole profile. The local copy is updated first and the
  /// profile recorded as the pending replacement until a push confirms it.
  /// Queued field edits are older than the replacement and are dropped.
  pub async fn update_profile(&self, profile: Profile) -> Result<Profile, SyncError> {
    self.status.local_write(|| -> Result<()> {
      self.queue.clear()?;
      self.snapshot.save(&profile, true)?;
      self.snapshot.save_pending_replacement(&profile)?;
      *self.memory.lock() = Some(profile.clone());
      Ok(())
    })?;

    if !self.ctx.is_online() {
      return Ok(self.with_local_media(profile));
    }

    let _serial = self.pass.lock().await;
    match self
      .ctx
      .remote
      .set(USERS, &self.ctx.uid, profile.to_document(), true)
      .await
    {
      Ok(()) => {
        debug!(uid = %self.ctx.uid, "Pushed profile");
        self.confirm_replacement(&profile)?;
        self.settle();
      }
      Err(e) => warn!(error = %e, "Profile push failed, keeping pending replacement"),
    }
    Ok(self.with_local_media(profile))
  }

  /// Drop the pending replacement if it is still `pushed`. With nothing
  /// queued behind it the snapshot is clean as well.
  fn confirm_replacement(&self, pushed: &Profile) -> Result<()> {
    self.status.without_writes(|| -> Result<()> {
      if self.snapshot.load_pending_replacement()?.as_ref() != Some(pushed) {
        return Ok(());
      }
      if self.queue.is_empty()? {
        self.snapshot.save(pushed, false)
      } else {
        self.snapshot.clear_pending_replacement()
      }
    })
  }

  /// Change some fields. The delta is applied to the snapshot and to any
  /// pending replacement, then pushed or queued. With older edits still
  /// queued it is queued behind them and a pass runs.
  pub async fn update_fields(&self, delta: ProfileDelta) -> Result<Profile, SyncError> {
    let online = self.ctx.is_online();
    let profile = self.status.local_write(|| -> Result<Profile> {
      let profile = match self.snapshot.update(|p| p.apply(&delta))? {
        Some(profile) => profile,
        None => {
          let mut profile = self.local_profile();
          profile.apply(&delta);
          self.snapshot.save(&profile, true)?;
          profile
        }
      };
      self.snapshot.update_pending_replacement(|p| p.apply(&delta))?;
      *self.memory.lock() = Some(profile.clone());
      if !online && !delta.is_empty() {
        self.queue.enqueue_edit(&self.ctx.uid, delta.clone())?;
      }
      Ok(profile)
    })?;

    if delta.is_empty() {
      self.settle();
      return Ok(self.with_local_media(profile));
    }
    if !online {
      return Ok(self.with_local_media(profile));
    }

    let serial = self.pass.lock().await;
    if !self.queue.is_empty()? {
      self.queue.enqueue_edit(&self.ctx.uid, delta)?;
      drop(serial);
      debug!(uid = %self.ctx.uid, "Queued profile fields behind older edits");
      let outcome = self.sync_now().await;
      if let Some(e) = outcome.last_error {
        warn!(error = %e, "Queued profile fields not pushed yet");
      }
      return Ok(self.with_local_media(self.local_profile()));
    }

    match self.push_delta(&delta).await {
      Ok(()) => {
        debug!(uid = %self.ctx.uid, "Pushed profile fields");
        self.status.without_writes(|| -> Result<()> {
          if self.queue.is_empty()? && self.snapshot.load_pending_replacement()?.is_none() {
            self.snapshot.clear_dirty()?;
          }
          Ok(())
        })?;
        self.settle();
      }
      Err(e) => {
        warn!(error = %e, "Profile field push failed, queueing");
        self.queue.enqueue_edit(&self.ctx.uid, delta)?;
      }
    }
    Ok(self.with_local_media(profile))
  }

  /// Incremental update; a missing document is created by a merge write.
  async fn push_delta(&self, delta: &ProfileDelta) -> Result<(), SyncError> {
    let fields = delta.to_document();
    match self
      .ctx
      .remote
      .update(USERS, &self.ctx.uid, fields.clone())
      .await
    {
      Err(e) if e.is_not_found() => self.ctx.remote.set(USERS, &self.ctx.uid, fields, true).await,
      other => other,
    }
  }

  /// Stage `bytes` as the avatar and try to upload it. Returns the URL to
  /// display: the remote URL, or the local file until the upload succeeds.
  pub async fn upload_avatar(&self, bytes: Vec<u8>) -> Result<String, SyncError> {
    let local_path = self
      .ctx
      .staging
      .stage("avatar", &format!("{}.jpg", self.ctx.uid), &bytes)
      .await?;
    let pending = PendingAvatar {
      local_path,
      remote_path: format!("avatars/{}.jpg", self.ctx.uid),
      created_at: Utc::now(),
    };
    self
      .status
      .local_write(|| self.ctx.store.set(AVATAR_KIND, &self.ctx.uid, &pending))?;

    if self.ctx.is_online() {
      let _serial = self.pass.lock().await;
      match self.push_avatar(&pending).await {
        Ok(url) => return Ok(url),
        Err(e) => warn!(error = %e, "Avatar upload failed, serving local file"),
      }
    }
    Ok(pending.local_path.display().to_string())
  }

  /// Upload the staged avatar and point the profile at it. With field edits
  /// still queued the URL change is queued behind them.
  async fn push_avatar(&self, pending: &PendingAvatar) -> Result<String, SyncError> {
    let bytes = self.ctx.staging.read(&pending.local_path).await?;
    let url = self.ctx.blobs.upload(&pending.remote_path, bytes).await?;

    let delta = ProfileDelta {
      avatar_url: Some(url.clone()),
      ..ProfileDelta::default()
    };
    self
      .commit_upload(delta, || self.ctx.store.remove(AVATAR_KIND, &self.ctx.uid))
      .await?;

    if let Err(e) = self.ctx.staging.remove(&pending.local_path).await {
      warn!(error = %e, "Failed to remove staged avatar");
    }

    info!(uid = %self.ctx.uid, path = %pending.remote_path, "Uploaded avatar");
    Ok(url)
  }

  fn pending_project_images(&self) -> Vec<PendingProjectImage> {
    match self.ctx.store.get(PROJECT_IMAGES_KIND, &self.ctx.uid) {
      Ok(images) => images.unwrap_or_default(),
      Err(e) => {
        warn!(error = %e, "Failed to read pending project images");
        Vec::new()
      }
    }
  }

  fn forget_project_image(&self, project_id: &str) -> Result<()> {
    self.ctx.store.update(
      PROJECT_IMAGES_KIND,
      &self.ctx.uid,
      |images: Option<Vec<PendingProjectImage>>| {
        let mut images = images.unwrap_or_default();
        images.retain(|image| image.project_id != project_id);
        (!images.is_empty()).then_some(images)
      },
    )?;
    Ok(())
  }

  /// Add a project to the profile's project list. The list change is pushed
  /// or queued like any field edit. A cover image is staged and uploaded
  /// afterwards; reads show the staged file until then.
  pub async fn create_project(&self, new: NewProject) -> Result<Project, SyncError> {
    let project = Project {
      id: uuid::Uuid::new_v4().to_string(),
      title: new.title,
      description: new.description,
      skills: new.skills,
      img_url: None,
      created_at: Some(Utc::now().timestamp_millis()),
      created_by_id: Some(self.ctx.uid.clone()),
    };

    let staged = match new.image {
      Some(bytes) => {
        let local_path = self
          .ctx
          .staging
          .stage("project", &format!("{}.jpg", project.id), &bytes)
          .await?;
        let pending = PendingProjectImage {
          project_id: project.id.clone(),
          local_path,
          remote_path: format!("projects/{}/{}.jpg", self.ctx.uid, project.id),
          created_at: Utc::now(),
        };
        self.status.local_write(|| {
          self.ctx.store.update(
            PROJECT_IMAGES_KIND,
            &self.ctx.uid,
            |images: Option<Vec<PendingProjectImage>>| {
              let mut images = images.unwrap_or_default();
              images.push(pending.clone());
              Some(images)
            },
          )
        })?;
        Some(pending)
      }
      None => None,
    };

    let mut projects = self.local_profile().projects;
    projects.push(project.clone());
    self
      .update_fields(ProfileDelta {
        projects: Some(projects),
        ..ProfileDelta::default()
      })
      .await?;
    info!(uid = %self.ctx.uid, project_id = %project.id, "Created project");

    if let Some(pending) = staged {
      if self.ctx.is_online() {
        let _serial = self.pass.lock().await;
        // A pass run by the list push may have uploaded it already
        let still_staged = self
          .pending_project_images()
          .iter()
          .any(|image| image.project_id == pending.project_id);
        if !still_staged {
          return Ok(self.shown_project(project));
        }
        if let Err(e) = self.push_project_image(&pending).await {
          warn!(project_id = %pending.project_id, error = %e, "Project image upload failed, serving local file");
        }
      }
    }

    Ok(self.shown_project(project))
  }

  /// `project` as reads show it now.
  fn shown_project(&self, project: Project) -> Project {
    self
      .with_local_media(self.local_profile())
      .projects
      .into_iter()
      .find(|p| p.id == project.id)
      .unwrap_or(project)
  }

  /// Upload a staged project cover and point the project at it. An image
  /// whose project is no longer in the list is dropped.
  async fn push_project_image(&self, pending: &PendingProjectImage) -> Result<(), SyncError> {
    let mut projects = self.local_profile().projects;
    if !projects.iter().any(|p| p.id == pending.project_id) {
      debug!(project_id = %pending.project_id, "Project gone, dropping its image");
      self.forget_project_image(&pending.project_id)?;
      if let Err(e) = self.ctx.staging.remove(&pending.local_path).await {
        warn!(error = %e, "Failed to remove staged project image");
      }
      return Ok(());
    }

    let bytes = self.ctx.staging.read(&pending.local_path).await?;
    let url = self.ctx.blobs.upload(&pending.remote_path, bytes).await?;
    for project in projects.iter_mut().filter(|p| p.id == pending.project_id) {
      project.img_url = Some(url.clone());
    }

    let delta = ProfileDelta {
      projects: Some(projects),
      ..ProfileDelta::default()
    };
    self
      .commit_upload(delta, || self.forget_project_image(&pending.project_id))
      .await?;

    if let Err(e) = self.ctx.staging.remove(&pending.local_path).await {
      warn!(error = %e, "Failed to remove staged project image");
    }
    info!(project_id = %pending.project_id, path = %pending.remote_path, "Uploaded project image");
    Ok(())
  }

  /// Point the profile at a freshly uploaded file: push `delta`, or queue
  /// it behind older field edits, then apply it locally and run `forget`
  /// as part of the same local write.
  async fn commit_upload(
    &self,
    delta: ProfileDelta,
    forget: impl FnOnce() -> Result<()>,
  ) -> Result<(), SyncError> {
    let behind = !self.queue.is_empty()?;
    if !behind {
      self.push_delta(&delta).await?;
    }

    let seed = self.local_profile();
    self.status.local_write(|| -> Result<()> {
      let profile = self.snapshot.amend(|p| {
        if p.id.is_empty() {
          *p = seed;
        }
        p.apply(&delta);
      })?;
      self.snapshot.update_pending_replacement(|p| p.apply(&delta))?;
      if behind {
        self.queue.enqueue_edit(&self.ctx.uid, delta.clone())?;
        self.snapshot.mark_dirty()?;
      }
      *self.memory.lock() = Some(profile);
      forget()
    })?;
    self.settle();
    Ok(())
  }

  /// Push the dirty snapshot and pending replacement, drain queued field
  /// edits, upload staged images, then pull the authoritative profile.
  pub async fn sync_now(&self) -> SyncOutcome {
    if !self.ctx.is_online() {
      return SyncOutcome::offline(self.state());
    }

    let _serial = self.pass.lock().await;
    let pass = self.status.begin(KIND);
    info!(kind = KIND, "Sync pass started");

    let mut outcome = SyncOutcome::default();
    if let Err(e) = self.run_pass(&mut outcome).await {
      outcome.record_failure(e);
    }

    outcome.state = self.settled_state(outcome.failed > 0);
    pass.finish(outcome.state);
    info!(
      kind = KIND,
      pushed = outcome.pushed,
      applied = outcome.applied,
      failed = outcome.failed,
      state = ?outcome.state,
      "Sync pass finished"
    );
    outcome
  }

  async fn run_pass(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
    if self.snapshot.is_dirty()? {
      if let Some(profile) = self.snapshot.load()? {
        self
          .ctx
          .remote
          .set(USERS, &self.ctx.uid, profile.to_document(), true)
          .await?;
        outcome.pushed += 1;
      }
    }

    if let Some(replacement) = self.snapshot.load_pending_replacement()? {
      self
        .ctx
        .remote
        .set(USERS, &self.ctx.uid, replacement.to_document(), true)
        .await?;
      self.status.without_writes(|| -> Result<()> {
        if self.snapshot.load_pending_replacement()?.as_ref() == Some(&replacement) {
          self.snapshot.clear_pending_replacement()?;
        }
        Ok(())
      })?;
      outcome.pushed += 1;
    }

    drain_queue(&self.queue, outcome, |queued| self.apply_queued(queued)).await?;

    if let Some(pending) = self.pending_avatar() {
      match self.push_avatar(&pending).await {
        Ok(_) => outcome.pushed += 1,
        Err(e) => outcome.record_failure(e),
      }
    }

    for image in self.pending_project_images() {
      if !self.ctx.staging.exists(&image.local_path).await {
        warn!(project_id = %image.project_id, "Staged project image missing, dropping it");
        self.forget_project_image(&image.project_id)?;
        continue;
      }
      match self.push_project_image(&image).await {
        Ok(()) => outcome.pushed += 1,
        Err(e) => outcome.record_failure(e),
      }
    }

    if outcome.failed == 0 {
      outcome.pulled = self.pull().await?;
    }
    Ok(())
  }

  async fn apply_queued(&self, queued: QueuedOp<ProfileDelta>) -> Result<(), SyncError> {
    match queued.op {
      PendingOp::Edit(edit) => self.push_delta(&edit.delta).await,
      // Profiles are never deleted from here
      PendingOp::Delete(_) => Ok(()),
    }
  }

  /// Overwrite the local copy with the remote one. Returns false, keeping
  /// the local copy, when something is still queued or a local write
  /// landed while fetching.
  async fn pull(&self) -> Result<bool, SyncError> {
    let seen = self.status.generation();
    let doc = self.ctx.remote.get(USERS, &self.ctx.uid).await?;

    let stored = self.status.if_unchanged(seen, || -> Result<bool> {
      if !self.queue.is_empty()? || self.snapshot.load_pending_replacement()?.is_some() {
        return Ok(false);
      }
      match doc {
        Some(doc) => {
          let profile = Profile::from_document(&self.ctx.uid, &doc);
          self.snapshot.save(&profile, false)?;
          *self.memory.lock() = Some(profile);
        }
        None => self.snapshot.clear_dirty()?,
      }
      Ok(true)
    });
    let pulled = stored.transpose()?.unwrap_or(false);
    if !pulled {
      debug!(uid = %self.ctx.uid, "Local changes outstanding, keeping local profile");
    }
    Ok(pulled)
  }

  fn settle(&self) {
    if !self.status.state().is_syncing() {
      self.status.set(self.settled_state(false));
    }
  }

  fn settled_state(&self, failed: bool) -> SyncState {
    let dirty = self.snapshot.is_dirty().unwrap_or(true);
    let replacement = self
      .snapshot
      .load_pending_replacement()
      .map(|r| r.is_some())
      .unwrap_or(false);
    let pending = self.queue.len().unwrap_or(0)
      + usize::from(replacement)
      + usize::from(self.pending_avatar().is_some())
      + self.pending_project_images().len();
    SyncState::derive(dirty, pending, failed)
  }
}

#[async_trait]
impl Reconciler for ProfileSync {
  fn name(&self) -> &'static str {
    KIND
  }

  async fn sync_now(&self) -> SyncOutcome {
    ProfileSync::sync_now(self).await
  }

  fn state(&self) -> SyncState {
    ProfileSync::state(self)
  }
}
