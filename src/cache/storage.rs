//! Response storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::store::open_connection;
use crate::transport::Method;

/// A stored last-known-good response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

/// Trait for response cache backends.
pub trait ResponseStore: Send + Sync {
  /// Look up an entry in one bucket.
  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Store (or overwrite) an entry in one bucket.
  fn put(
    &self,
    bucket: &str,
    key: &str,
    url: &str,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()>;

  /// Delete every bucket not named in `keep`. Returns the number of entries removed.
  fn retain_buckets(&self, keep: &[&str]) -> Result<usize>;

  /// Names of the buckets currently holding entries.
  fn buckets(&self) -> Result<Vec<String>>;
}

/// Stable, fixed-length cache key for a request.
pub fn request_key(method: &Method, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// SQLite-based response storage, owned by the cache engine.
pub struct SqliteResponseStore {
  conn: Mutex<Connection>,
}

impl SqliteResponseStore {
  /// Open the response tables inside the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::with_connection(open_connection(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory response cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(RESPONSE_SCHEMA)
      .map_err(|e| eyre!("Failed to run response cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

const RESPONSE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_key)
);
"#;

impl ResponseStore for SqliteResponseStore {
  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT status, content_type, body FROM cache_entries
         WHERE bucket = ? AND request_key = ?",
        params![bucket, key],
        |row| {
          Ok(CachedResponse {
            status: row.get(0)?,
            content_type: row.get(1)?,
            body: row.get(2)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))
  }

  fn put(
    &self,
    bucket: &str,
    key: &str,
    url: &str,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (bucket, request_key, request_url, status, content_type, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![bucket, key, url, status, content_type, body],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn retain_buckets(&self, keep: &[&str]) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = if keep.is_empty() {
      conn.execute("DELETE FROM cache_entries", [])
    } else {
      let placeholders = vec!["?"; keep.len()].join(", ");
      conn.execute(
        &format!(
          "DELETE FROM cache_entries WHERE bucket NOT IN ({})",
          placeholders
        ),
        params_from_iter(keep.iter()),
      )
    }
    .map_err(|e| eyre!("Failed to evict cache buckets: {}", e))?;

    Ok(removed)
  }

  fn buckets(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT bucket FROM cache_entries ORDER BY bucket")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let buckets = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(buckets)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_depends_on_method() {
    let url = "https://h/api/task-api?action=tasks";
    assert_ne!(request_key(&Method::GET, url), request_key(&Method::POST, url));
    assert_eq!(request_key(&Method::GET, url).len(), 64);
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let store = SqliteResponseStore::open_in_memory().unwrap();
    store.put("dynamic-v1", "k", "u", 200, None, b"old").unwrap();
    store
      .put("dynamic-v1", "k", "u", 200, Some("application/json"), b"new")
      .unwrap();

    let entry = store.get("dynamic-v1", "k").unwrap().unwrap();
    assert_eq!(entry.body, b"new");
    assert_eq!(entry.content_type.as_deref(), Some("application/json"));
  }

  #[test]
  fn test_buckets_are_separate() {
    let store = SqliteResponseStore::open_in_memory().unwrap();
    store.put("static-v1", "k", "u", 200, None, b"asset").unwrap();
    assert!(store.get("dynamic-v1", "k").unwrap().is_none());
  }

  #[test]
  fn test_retain_buckets_drops_old_versions() {
    let store = SqliteResponseStore::open_in_memory().unwrap();
    store.put("static-v1", "a", "u", 200, None, b"1").unwrap();
    store.put("dynamic-v1", "b", "u", 200, None, b"2").unwrap();
    store.put("static-v2", "a", "u", 200, None, b"3").unwrap();

    let removed = store.retain_buckets(&["static-v2", "dynamic-v2"]).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.buckets().unwrap(), vec!["static-v2".to_string()]);
  }
}
