//! Provenance types shared by the cache engine and the agenda.

use chrono::{DateTime, Utc};

/// Data handed back to a reader together with where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was stored locally (None for fresh network data)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from the local store because the network could not answer.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// True when the server confirmed this data just now.
  pub fn is_fresh(&self) -> bool {
    self.source == CacheSource::Network
  }
}

/// Indicates where a response or a record set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Straight off the wire
  Network,
  /// Cache hit that never needs revalidation (static assets)
  CacheFresh,
  /// Cached copy served because the network failed
  CacheStale,
  /// Nothing reachable; synthesized or local-store data
  Offline,
}
