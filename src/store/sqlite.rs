//! Durable record storage on SQLite.
//!
//! Records are JSON envelopes `{schema, kind, payload}` addressed by
//! `(kind, key)`. A record whose envelope or payload does not decode is
//! reported once and then treated as absent, so corrupt local data never
//! blocks a read.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::error::SyncError;

/// Bumped when a persisted payload shape changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
  schema: u32,
  kind: String,
  payload: T,
}

pub(crate) fn encode_envelope<T: Serialize>(kind: &str, payload: &T) -> Result<String> {
  let envelope = Envelope {
    schema: SCHEMA_VERSION,
    kind: kind.to_string(),
    payload,
  };
  serde_json::to_string(&envelope).map_err(|e| eyre!("Failed to serialize {} record: {}", kind, e))
}

pub(crate) fn decode_envelope<T: DeserializeOwned>(kind: &str, raw: &str) -> Result<T, SyncError> {
  let envelope: Envelope<serde_json::Value> = serde_json::from_str(raw)?;
  if envelope.schema != SCHEMA_VERSION {
    return Err(SyncError::LocalCorruption(format!(
      "unsupported schema {} for {} record",
      envelope.schema, kind
    )));
  }
  if envelope.kind != kind {
    return Err(SyncError::LocalCorruption(format!(
      "expected {} record, found {}",
      kind, envelope.kind
    )));
  }
  Ok(serde_json::from_value(envelope.payload)?)
}

/// Keyed access to typed, versioned local records.
pub trait RecordStore: Send + Sync {
  fn get<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>>;

  fn set<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<()>;

  fn remove(&self, kind: &str, key: &str) -> Result<()>;

  /// Atomic read-modify-write. Returning `None` from `f` removes the record.
  fn update<T, F>(&self, kind: &str, key: &str, f: F) -> Result<Option<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>;
}

/// Record operations scoped to one open transaction.
pub struct RecordTx<'a> {
  conn: &'a Connection,
}

impl RecordTx<'_> {
  pub fn get<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = self
      .conn
      .query_row(
        "SELECT envelope FROM records WHERE kind = ? AND key = ?",
        params![kind, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} record: {}", kind, e))?;

    let Some(raw) = raw else {
      return Ok(None);
    };

    match decode_envelope(kind, &raw) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        warn!(kind, key, error = %e, "Ignoring unreadable local record");
        Ok(None)
      }
    }
  }

  pub fn set<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<()> {
    let envelope = encode_envelope(kind, value)?;
    self
      .conn
      .execute(
        "INSERT OR REPLACE INTO records (kind, key, envelope, updated_at)
         VALUES (?, ?, ?, ?)",
        params![kind, key, envelope, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store {} record: {}", kind, e))?;
    Ok(())
  }

  pub fn remove(&self, kind: &str, key: &str) -> Result<()> {
    self
      .conn
      .execute(
        "DELETE FROM records WHERE kind = ? AND key = ?",
        params![kind, key],
      )
      .map_err(|e| eyre!("Failed to remove {} record: {}", kind, e))?;
    Ok(())
  }

  pub(crate) fn conn(&self) -> &Connection {
    self.conn
  }
}

/// SQLite-backed local store, shared by every queue and snapshot.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  /// Run `f` inside one transaction; any error rolls everything back.
  pub fn transaction<R>(&self, f: impl FnOnce(&RecordTx<'_>) -> Result<R>) -> Result<R> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("BEGIN IMMEDIATE TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    match f(&RecordTx { conn: &conn }) {
      Ok(value) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(value)
      }
      Err(e) => {
        if let Err(rollback_err) = conn.execute("ROLLBACK", []) {
          warn!(error = %rollback_err, "Rollback failed");
        }
        Err(e)
      }
    }
  }

  /// Read without opening a write transaction.
  pub(crate) fn read<R>(&self, f: impl FnOnce(&RecordTx<'_>) -> Result<R>) -> Result<R> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&RecordTx { conn: &conn })
  }
}

/// Schema for local records and the pending-operation queue.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    envelope TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, key)
);

-- seq is never reused, so FIFO order survives deletes and restarts
CREATE TABLE IF NOT EXISTS pending_ops (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    op TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_kind ON pending_ops(kind, seq);
"#;

impl RecordStore for SqliteStore {
  fn get<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
    self.read(|tx| tx.get(kind, key))
  }

  fn set<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<()> {
    self.transaction(|tx| tx.set(kind, key, value))
  }

  fn remove(&self, kind: &str, key: &str) -> Result<()> {
    self.transaction(|tx| tx.remove(kind, key))
  }

  fn update<T, F>(&self, kind: &str, key: &str, f: F) -> Result<Option<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    self.transaction(|tx| {
      let next = f(tx.get(kind, key)?);
      match &next {
        Some(value) => tx.set(kind, key, value)?,
        None => tx.remove(kind, key)?,
      }
      Ok(next)
    })
  }
}
