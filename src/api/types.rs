use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Which remote collection an entity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Event,
  Task,
}

impl EntityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Event => "event",
      EntityKind::Task => "task",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "event" => Some(EntityKind::Event),
      "task" => Some(EntityKind::Task),
      _ => None,
    }
  }

  /// Field holding the list in a `{success, ...}` list response
  pub fn collection_field(&self) -> &'static str {
    match self {
      EntityKind::Event => "events",
      EntityKind::Task => "tasks",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A mutation the remote API understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Create,
  Update,
  CompleteStatus,
  ProgressUpdate,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::CompleteStatus => "complete_status",
      Operation::ProgressUpdate => "progress_update",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Operation::Create),
      "update" => Some(Operation::Update),
      "complete_status" => Some(Operation::CompleteStatus),
      "progress_update" => Some(Operation::ProgressUpdate),
      _ => None,
    }
  }

  /// Events only support plain create/update.
  pub fn applies_to(&self, kind: EntityKind) -> bool {
    match kind {
      EntityKind::Event => matches!(self, Operation::Create | Operation::Update),
      EntityKind::Task => true,
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
    Self { start, end }
  }

  /// The calendar month containing `date`
  pub fn month_of(date: NaiveDate) -> Self {
    let start = date.with_day(1).unwrap_or(date);
    let end = start
      .checked_add_months(chrono::Months::new(1))
      .unwrap_or(NaiveDate::MAX);
    Self { start, end }
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date < self.end
  }
}

/// Calendar event as the server reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub title: String,
  pub start: String,
  #[serde(default)]
  pub end: Option<String>,
  #[serde(default)]
  pub all_day: bool,
  #[serde(default)]
  pub description: Option<String>,
  // Server fields we don't model, kept so the cached copy round-trips
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

impl Event {
  pub fn start_date(&self) -> Option<NaiveDate> {
    date_prefix(&self.start)
  }
}

/// Task as the server reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub due_date: Option<String>,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub priority: Option<String>,
  /// Percent complete, 0-100
  #[serde(default)]
  pub progress: u8,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

impl Task {
  pub fn due(&self) -> Option<NaiveDate> {
    self.due_date.as_deref().and_then(date_prefix)
  }
}

/// Parse the `YYYY-MM-DD` prefix of a date or datetime string.
pub fn date_prefix(s: &str) -> Option<NaiveDate> {
  let head = s.get(..10)?;
  NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Server ids arrive as numbers or strings depending on the endpoint.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// Extract the entity id from a mutation payload, if it names one.
pub fn payload_id(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
