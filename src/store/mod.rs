//! Durable local state: records, pending operations, snapshots and staged
//! blobs. Everything here is synchronous with respect to the network.

mod blobs;
mod queue;
mod snapshot;
mod sqlite;

pub use blobs::BlobStaging;
pub use queue::{PendingDelete, PendingEdit, PendingOp, PendingQueue, QueuedOp};
pub use snapshot::SnapshotStore;
pub use sqlite::{RecordStore, RecordTx, SqliteStore, SCHEMA_VERSION};
