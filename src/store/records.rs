//! Cached event/task collections.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::LocalStore;
use crate::api::types::{DateRange, EntityKind, Event, Task};

/// A server entity mirrored in the local store.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  const KIND: EntityKind;

  /// Server-assigned id, unique within the kind
  fn record_id(&self) -> &str;

  /// Date the collection is indexed by
  fn source_date(&self) -> Option<NaiveDate>;

  fn status(&self) -> Option<&str> {
    None
  }
}

impl Record for Event {
  const KIND: EntityKind = EntityKind::Event;

  fn record_id(&self) -> &str {
    &self.id
  }

  fn source_date(&self) -> Option<NaiveDate> {
    self.start_date()
  }
}

impl Record for Task {
  const KIND: EntityKind = EntityKind::Task;

  fn record_id(&self) -> &str {
    &self.id
  }

  fn source_date(&self) -> Option<NaiveDate> {
    self.due()
  }

  fn status(&self) -> Option<&str> {
    Some(&self.status)
  }
}

fn table(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::Event => "events",
    EntityKind::Task => "tasks",
  }
}

fn date_key(date: NaiveDate) -> String {
  date.format("%Y-%m-%d").to_string()
}

/// SQLite's `datetime('now')` format
fn parse_sqlite_datetime(s: &str) -> Result<DateTime<Utc>> {
  NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

impl LocalStore {
  /// Replace every cached record of `T`'s kind dated inside `range` with `records`.
  ///
  /// Runs in one transaction: either the whole range is replaced or the
  /// previous contents stay untouched. Returns the number of records stored.
  pub fn replace_month_range<T: Record>(&self, range: DateRange, records: &[T]) -> Result<usize> {
    let table = table(T::KIND);
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute(
        &format!(
          "DELETE FROM {} WHERE source_date >= ? AND source_date < ?",
          table
        ),
        params![date_key(range.start), date_key(range.end)],
      )
      .map_err(|e| eyre!("Failed to clear {} range: {}", table, e))?;

    let mut stored = 0;
    {
      let mut stmt = tx
        .prepare(&format!(
          "INSERT OR REPLACE INTO {} (id, source_date, status, data, cached_at)
           VALUES (?, ?, ?, ?, datetime('now'))",
          table
        ))
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for record in records {
        let Some(date) = record.source_date() else {
          warn!(kind = %T::KIND, id = record.record_id(), "record has no usable date, not cached");
          continue;
        };
        let data =
          serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

        stmt
          .execute(params![record.record_id(), date_key(date), record.status(), data])
          .map_err(|e| eyre!("Failed to store {} {}: {}", T::KIND, record.record_id(), e))?;
        stored += 1;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(kind = %T::KIND, removed, stored, "replaced cached range");
    Ok(stored)
  }

  /// All cached records of `T`'s kind.
  pub fn read_all<T: Record>(&self) -> Result<Vec<T>> {
    self.select(
      &format!(
        "SELECT data FROM {} ORDER BY source_date, id",
        table(T::KIND)
      ),
      &[],
    )
  }

  /// Cached records of `T`'s kind dated inside `range`.
  pub fn read_range<T: Record>(&self, range: DateRange) -> Result<Vec<T>> {
    self.select(
      &format!(
        "SELECT data FROM {} WHERE source_date >= ? AND source_date < ?
         ORDER BY source_date, id",
        table(T::KIND)
      ),
      &[&date_key(range.start), &date_key(range.end)],
    )
  }

  /// When the oldest cached record of `T`'s kind inside `range` was stored.
  pub fn range_cached_at<T: Record>(&self, range: DateRange) -> Result<Option<DateTime<Utc>>> {
    let table = table(T::KIND);
    let conn = self.lock()?;
    let oldest: Option<String> = conn
      .query_row(
        &format!(
          "SELECT MIN(cached_at) FROM {} WHERE source_date >= ? AND source_date < ?",
          table
        ),
        params![date_key(range.start), date_key(range.end)],
        |row| row.get::<_, Option<String>>(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} cache time: {}", table, e))?
      .flatten();

    oldest.as_deref().map(parse_sqlite_datetime).transpose()
  }

  /// Cached tasks with the given status.
  pub fn read_tasks_by_status(&self, status: &str) -> Result<Vec<Task>> {
    self.select(
      "SELECT data FROM tasks WHERE status = ? ORDER BY source_date, id",
      &[&status],
    )
  }

  fn select<T: Record>(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<T>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<Vec<u8>> = stmt
      .query_map(args, |row| row.get(0))
      .map_err(|e| eyre!("Failed to query {}: {}", table(T::KIND), e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", table(T::KIND), e))?;

    Ok(
      rows
        .into_iter()
        .filter_map(|data| match serde_json::from_slice(&data) {
          Ok(record) => Some(record),
          Err(e) => {
            warn!(kind = %T::KIND, error = %e, "skipping unreadable cached record");
            None
          }
        })
        .collect(),
    )
  }
}
