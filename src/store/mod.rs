//! Durable local store: cached events and tasks plus the pending-action queue.
//!
//! Both the agenda and the cache engine open the same database file through
//! their own connections; SQLite serializes their transactions.

mod queue;
mod records;
pub mod schema;

pub use queue::{EntityKey, NewAction, PendingAction, QueueRepository, RejectedAction};
pub use records::Record;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// SQLite-backed local store
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store at `path`.
  ///
  /// If the recorded cache version differs from `cache_version`, cached
  /// events and tasks are dropped. Pending actions always survive.
  pub fn open(path: &Path, cache_version: u32) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    Self::with_connection(open_connection(path)?, cache_version)
  }

  pub fn open_in_memory(cache_version: u32) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn, cache_version)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("calsync").join("store.db"))
  }

  fn with_connection(conn: Connection, cache_version: u32) -> Result<Self> {
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.apply_cache_version(cache_version)?;

    Ok(store)
  }

  fn apply_cache_version(&self, version: u32) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let recorded: Option<String> = tx
      .query_row(
        "SELECT value FROM meta WHERE key = 'cache_version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache version: {}", e))?;

    let wanted = version.to_string();
    if recorded.as_deref() != Some(wanted.as_str()) {
      if let Some(old) = &recorded {
        info!(old = %old, new = version, "cache version changed, dropping cached records");
      }
      tx.execute_batch("DELETE FROM events; DELETE FROM tasks;")
        .map_err(|e| eyre!("Failed to clear cached records: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('cache_version', ?)",
        params![wanted],
      )
      .map_err(|e| eyre!("Failed to record cache version: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Open a connection suitable for sharing the file with another context.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
    .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

  Ok(conn)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{DateRange, Event};
  use chrono::NaiveDate;
  use serde_json::json;

  fn event(id: &str, start: &str) -> Event {
    serde_json::from_value(json!({"id": id, "title": id, "start": start})).unwrap()
  }

  fn march() -> DateRange {
    DateRange::month_of(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
  }

  #[test]
  fn test_version_bump_keeps_pending_actions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let store = LocalStore::open(&path, 1).unwrap();
      store
        .replace_month_range(march(), &[event("1", "2024-03-02")])
        .unwrap();
      store
        .enqueue(NewAction::new(
          crate::api::types::EntityKind::Event,
          crate::api::types::Operation::Create,
          json!({"title": "Audit"}),
        ))
        .unwrap();
    }

    let store = LocalStore::open(&path, 2).unwrap();
    assert!(store.read_all::<Event>().unwrap().is_empty());
    assert_eq!(store.peek_all().unwrap().len(), 1);
  }

  #[test]
  fn test_same_version_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let store = LocalStore::open(&path, 4).unwrap();
      store
        .replace_month_range(march(), &[event("1", "2024-03-02")])
        .unwrap();
    }

    let store = LocalStore::open(&path, 4).unwrap();
    assert_eq!(store.read_all::<Event>().unwrap().len(), 1);
  }
}
