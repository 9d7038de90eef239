//! Offline-first sync engine for a user's profile and projects, portfolio,
//! résumés, contact requests and project applications, plus a
//! request-coalescing cache for skill search.
//!
//! Writes always land in the local SQLite store first. When the remote is
//! unreachable they are queued and replayed by the reconcilers in
//! [`sync`], either on demand or when the [`ConnectivityMonitor`] reports a
//! reconnect. Reads fall back to the last synced local copy.
//!
//! The remote document store and blob storage are abstract
//! ([`RemoteStore`], [`BlobStore`]); hosts plug in their own backends.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod directory;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod remote;
pub mod search;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheResult, CacheSource};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use directory::ProfileDirectory;
pub use engine::SyncEngine;
pub use error::{FetchError, SyncError};
pub use models::{
  ContactInbox, ContactRequest, NewProject, PortfolioItem, Profile, ProfileDelta, ProfileSummary,
  Project, ProjectApplication, Resume, Session, UserCard,
};
pub use remote::{BlobStore, Document, Filter, RemoteDocument, RemoteStore};
pub use search::{SearchMode, SearchRepository};
pub use sync::{ApplyOutcome, ConnectivityWatch, SyncOutcome, SyncState};
