//! Pending-action queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::LocalStore;
use crate::api::types::{payload_id, EntityKind, Operation};

/// A mutation waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
  pub local_id: i64,
  pub entity_kind: EntityKind,
  pub operation: Operation,
  /// Body the remote API expects, stored verbatim
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingAction {
  /// Which entity this action touches. Actions without a server id
  /// (typically creates) stand alone.
  pub fn entity_key(&self) -> EntityKey {
    EntityKey::of_payload(self.entity_kind, &self.payload)
      .unwrap_or(EntityKey::Local(self.local_id))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
  Remote(EntityKind, String),
  Local(i64),
}

impl EntityKey {
  /// Key of the server entity a payload targets, if it names one.
  pub fn of_payload(kind: EntityKind, payload: &Value) -> Option<Self> {
    payload_id(payload).map(|id| EntityKey::Remote(kind, id))
  }
}

/// An action as submitted, before the queue assigns its id.
#[derive(Debug, Clone)]
pub struct NewAction {
  pub entity_kind: EntityKind,
  pub operation: Operation,
  pub payload: Value,
}

impl NewAction {
  pub fn new(entity_kind: EntityKind, operation: Operation, payload: Value) -> Self {
    Self {
      entity_kind,
      operation,
      payload,
    }
  }
}

/// An action moved out of the replay path after a permanent rejection.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedAction {
  pub action: PendingAction,
  pub reason: String,
  pub rejected_at: DateTime<Utc>,
}

/// Durable FIFO of pending actions.
///
/// Injected into both the agenda (which enqueues) and the sync orchestrator
/// (which reads and removes).
pub trait QueueRepository: Send + Sync {
  /// Append an action and assign it the next local id.
  fn enqueue(&self, action: NewAction) -> Result<PendingAction>;

  /// Remove one action. Returns false if it was already gone.
  fn dequeue(&self, local_id: i64) -> Result<bool>;

  /// Every queued action in local id order.
  fn peek_all(&self) -> Result<Vec<PendingAction>>;

  fn len(&self) -> Result<usize>;

  fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Move an action to the rejected table. Returns false if it was already gone.
  fn dead_letter(&self, local_id: i64, reason: &str) -> Result<bool>;

  /// Actions moved out by [`QueueRepository::dead_letter`], oldest first.
  fn rejected(&self) -> Result<Vec<RejectedAction>>;
}

impl QueueRepository for LocalStore {
  fn enqueue(&self, action: NewAction) -> Result<PendingAction> {
    let conn = self.lock()?;
    let enqueued_at = Utc::now();
    let payload = serde_json::to_string(&action.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_actions (entity_kind, operation, payload, enqueued_at)
         VALUES (?, ?, ?, ?)",
        params![
          action.entity_kind.as_str(),
          action.operation.as_str(),
          payload,
          enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to queue action: {}", e))?;

    let local_id = conn.last_insert_rowid();
    debug!(local_id, kind = %action.entity_kind, operation = %action.operation, "queued action");

    Ok(PendingAction {
      local_id,
      entity_kind: action.entity_kind,
      operation: action.operation,
      payload: action.payload,
      enqueued_at,
    })
  }

  fn dequeue(&self, local_id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM pending_actions WHERE local_id = ?",
        params![local_id],
      )
      .map_err(|e| eyre!("Failed to remove action {}: {}", local_id, e))?;

    Ok(removed > 0)
  }

  fn peek_all(&self) -> Result<Vec<PendingAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT local_id, entity_kind, operation, payload, enqueued_at
         FROM pending_actions ORDER BY local_id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to read queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue: {}", e))?;

    rows.into_iter().map(RawAction::decode).collect()
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }

  fn dead_letter(&self, local_id: i64, reason: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let row = tx
      .query_row(
        "SELECT local_id, entity_kind, operation, payload, enqueued_at
         FROM pending_actions WHERE local_id = ?",
        params![local_id],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read action {}: {}", local_id, e))?;

    let Some(raw) = row else {
      return Ok(false);
    };

    tx.execute(
      "INSERT OR REPLACE INTO rejected_actions
         (local_id, entity_kind, operation, payload, enqueued_at, reason, rejected_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        raw.local_id,
        raw.entity_kind,
        raw.operation,
        raw.payload,
        raw.enqueued_at,
        reason,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to record rejected action {}: {}", local_id, e))?;
    tx.execute(
      "DELETE FROM pending_actions WHERE local_id = ?",
      params![local_id],
    )
    .map_err(|e| eyre!("Failed to remove action {}: {}", local_id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(true)
  }

  fn rejected(&self) -> Result<Vec<RejectedAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT local_id, entity_kind, operation, payload, enqueued_at, reason, rejected_at
         FROM rejected_actions ORDER BY local_id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          read_row(row)?,
          row.get::<_, String>(5)?,
          row.get::<_, String>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read rejected actions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read rejected actions: {}", e))?;

    rows
      .into_iter()
      .map(|(raw, reason, rejected_at)| {
        Ok(RejectedAction {
          action: raw.decode()?,
          reason,
          rejected_at: parse_timestamp(&rejected_at)?,
        })
      })
      .collect()
  }
}

/// Row as stored, before the text columns are parsed.
struct RawAction {
  local_id: i64,
  entity_kind: String,
  operation: String,
  payload: String,
  enqueued_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawAction> {
  Ok(RawAction {
    local_id: row.get(0)?,
    entity_kind: row.get(1)?,
    operation: row.get(2)?,
    payload: row.get(3)?,
    enqueued_at: row.get(4)?,
  })
}

impl RawAction {
  // A row we can't read is an error, never a skip: dropping it would lose a mutation
  fn decode(self) -> Result<PendingAction> {
    let entity_kind = EntityKind::parse(&self.entity_kind)
      .ok_or_else(|| eyre!("Unknown entity kind '{}' in action {}", self.entity_kind, self.local_id))?;
    let operation = Operation::parse(&self.operation)
      .ok_or_else(|| eyre!("Unknown operation '{}' in action {}", self.operation, self.local_id))?;
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Corrupt payload in action {}: {}", self.local_id, e))?;

    Ok(PendingAction {
      local_id: self.local_id,
      entity_kind,
      operation,
      payload,
      enqueued_at: parse_timestamp(&self.enqueued_at)?,
    })
  }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}
