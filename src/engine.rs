//! Wires the stores, reconcilers and caches for one signed-in user.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::CoalescingCache;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::directory::ProfileDirectory;
use crate::models::{PortfolioItem, Resume, Session};
use crate::remote::{BlobStore, RemoteStore};
use crate::search::SearchRepository;
use crate::store::{BlobStaging, SqliteStore};
use crate::sync::{
  ApplicationSync, CollectionSync, ConnectivityWatch, ContactReviewSync, ProfileSync,
  SyncContext, SyncCoordinator, SyncOutcome, SyncState,
};

pub struct SyncEngine {
  session: Session,
  connectivity: Arc<dyn ConnectivityMonitor>,
  profile: Arc<ProfileSync>,
  portfolio: Arc<CollectionSync<PortfolioItem>>,
  resumes: Arc<CollectionSync<Resume>>,
  contacts: Arc<ContactReviewSync>,
  applications: Arc<ApplicationSync>,
  coordinator: Arc<SyncCoordinator>,
  search: SearchRepository,
  directory: ProfileDirectory,
}

impl SyncEngine {
  /// Open the engine over the database in the configured data directory.
  pub fn open(
    config: &Config,
    session: Session,
    remote: Arc<dyn RemoteStore>,
    blobs: Arc<dyn BlobStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
  ) -> Result<Self> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

    let store = Arc::new(SqliteStore::open(&config.database_path()?)?);
    info!(uid = %session.uid, data_dir = %data_dir.display(), "Opened sync engine");
    Ok(Self::with_store(
      config,
      session,
      store,
      data_dir.join("blobs"),
      remote,
      blobs,
      connectivity,
    ))
  }

  /// Build the engine over an already open store, staging blobs under
  /// `staging_root`.
  pub fn with_store(
    config: &Config,
    session: Session,
    store: Arc<SqliteStore>,
    staging_root: impl Into<PathBuf>,
    remote: Arc<dyn RemoteStore>,
    blobs: Arc<dyn BlobStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
  ) -> Self {
    let ctx = SyncContext {
      uid: session.uid.clone(),
      store: Arc::clone(&store),
      remote: Arc::clone(&remote),
      blobs,
      connectivity: Arc::clone(&connectivity),
      staging: BlobStaging::new(staging_root),
    };

    let profile = Arc::new(ProfileSync::new(ctx.clone(), session.clone()));
    let portfolio = Arc::new(CollectionSync::new(ctx.clone(), config.upload_concurrency));
    let resumes = Arc::new(CollectionSync::new(ctx.clone(), config.upload_concurrency));
    let contacts = Arc::new(ContactReviewSync::new(ctx.clone()));
    let applications = Arc::new(ApplicationSync::new(ctx));

    let mut coordinator = SyncCoordinator::new();
    coordinator.register(profile.clone());
    coordinator.register(portfolio.clone());
    coordinator.register(resumes.clone());
    coordinator.register(contacts.clone());
    coordinator.register(applications.clone());

    let search = SearchRepository::new(
      Arc::clone(&remote),
      Arc::clone(&connectivity),
      store,
      CoalescingCache::new(config.search_cache.capacity, config.search_cache.unit_cost),
      config.max_search_terms,
    );
    let directory = ProfileDirectory::new(remote, Arc::clone(&connectivity), config.summary_ttl());

    Self {
      session,
      connectivity,
      profile,
      portfolio,
      resumes,
      contacts,
      applications,
      coordinator: Arc::new(coordinator),
      search,
      directory,
    }
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn profile(&self) -> &ProfileSync {
    &self.profile
  }

  pub fn portfolio(&self) -> &CollectionSync<PortfolioItem> {
    &self.portfolio
  }

  pub fn resumes(&self) -> &CollectionSync<Resume> {
    &self.resumes
  }

  pub fn contacts(&self) -> &ContactReviewSync {
    &self.contacts
  }

  pub fn applications(&self) -> &ApplicationSync {
    &self.applications
  }

  pub fn search(&self) -> &SearchRepository {
    &self.search
  }

  pub fn directory(&self) -> &ProfileDirectory {
    &self.directory
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub async fn sync_all(&self) -> Vec<(&'static str, SyncOutcome)> {
    self.coordinator.sync_all().await
  }

  pub fn states(&self) -> Vec<(&'static str, SyncState)> {
    self.coordinator.states()
  }

  /// Start syncing every kind whenever the monitor reports a reconnect.
  pub fn watch_connectivity(&self) -> ConnectivityWatch {
    Arc::clone(&self.coordinator).spawn_connectivity_watch(self.connectivity.observe())
  }
}
