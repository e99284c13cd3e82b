//! Single entry point for UI code: reads from network-or-store, writes to
//! network-or-queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::types::{DateRange, EntityKind, Event, Operation, Task};
use crate::api::ApiClient;
use crate::cache::{CacheResult, CacheSource};
use crate::connectivity::ConnectivityHandle;
use crate::error::ApiError;
use crate::store::{EntityKey, LocalStore, NewAction, PendingAction, QueueRepository, Record};
use crate::sync::{Refresh, SyncTrigger};

/// What happened to a write, as the UI should present it.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
  /// The server acknowledged the change
  Confirmed,
  /// Stored locally; will be replayed when the server is reachable
  Queued(PendingAction),
  /// The server refused it; it will not be retried
  Failed(ApiError),
}

/// Calendar/task façade
#[derive(Clone)]
pub struct Agenda {
  api: ApiClient,
  store: Arc<LocalStore>,
  queue: Arc<dyn QueueRepository>,
  connectivity: ConnectivityHandle,
  /// Range most recently shown per kind; refreshed after confirmed writes
  views: Arc<Mutex<HashMap<EntityKind, DateRange>>>,
  sync: Arc<Mutex<Option<SyncTrigger>>>,
}

impl Agenda {
  pub fn new(
    api: ApiClient,
    store: Arc<LocalStore>,
    queue: Arc<dyn QueueRepository>,
    connectivity: ConnectivityHandle,
  ) -> Self {
    Self {
      api,
      store,
      queue,
      connectivity,
      views: Arc::new(Mutex::new(HashMap::new())),
      sync: Arc::new(Mutex::new(None)),
    }
  }

  /// Ask `trigger` for a drain whenever a write is queued behind earlier ones.
  pub fn attach_sync(&self, trigger: SyncTrigger) {
    if let Ok(mut slot) = self.sync.lock() {
      *slot = Some(trigger);
    }
  }

  /// Set the anti-forgery token attached to writes (direct and replayed
  /// through the same client).
  pub fn set_csrf_token(&self, token: Option<String>) {
    self.api.set_csrf_token(token);
  }

  pub async fn load_events(&self, range: DateRange) -> Result<CacheResult<Vec<Event>>> {
    self.load_range(range).await
  }

  pub async fn load_tasks(&self, range: DateRange) -> Result<CacheResult<Vec<Task>>> {
    self.load_range(range).await
  }

  /// Load the records of `T`'s kind dated inside `range`.
  ///
  /// Fresh network data replaces the cached range. When the network is
  /// unreachable the cached range is returned instead. A server rejection
  /// is an error carrying an [`ApiError`].
  pub async fn load_range<T: Record>(&self, range: DateRange) -> Result<CacheResult<Vec<T>>> {
    self.remember_view(T::KIND, range);

    if !self.connectivity.is_online() {
      return self.from_store(range);
    }

    match self.api.list::<T>(range).await {
      Ok(listing) => match listing.source {
        CacheSource::Network => {
          self.store.replace_month_range(range, &listing.records)?;
          Ok(CacheResult::from_network(listing.records))
        }
        CacheSource::CacheFresh | CacheSource::CacheStale | CacheSource::Offline => {
          debug!(kind = %T::KIND, source = ?listing.source, "no fresh listing, reading local store");
          self.from_store(range)
        }
      },
      Err(err) if err.is_transient() => {
        debug!(kind = %T::KIND, error = %err, "list failed, reading local store");
        self.from_store(range)
      }
      Err(err) => Err(err.into()),
    }
  }

  fn from_store<T: Record>(&self, range: DateRange) -> Result<CacheResult<Vec<T>>> {
    let records = self.store.read_range(range)?;
    let cached_at = self.store.range_cached_at::<T>(range)?;
    Ok(CacheResult::offline(records, cached_at))
  }

  /// Apply a mutation, queueing it when the server can't be reached.
  ///
  /// Only a failure to queue is an `Err`: the change would otherwise be lost.
  pub async fn write(
    &self,
    kind: EntityKind,
    operation: Operation,
    payload: Value,
  ) -> Result<WriteOutcome> {
    if !operation.applies_to(kind) {
      return Ok(WriteOutcome::Failed(ApiError::Unsupported { kind, operation }));
    }

    if self.connectivity.is_online() {
      if self.has_pending(kind, &payload)? {
        // Sending now would let the server see this before the queued change
        debug!(kind = %kind, "earlier change still queued, queueing behind it");
        let action = self.queue.enqueue(NewAction::new(kind, operation, payload))?;
        self.request_sync();
        return Ok(WriteOutcome::Queued(action));
      }

      match self.api.submit(kind, operation, &payload).await {
        Ok(()) => {
          if let Err(e) = self.refresh(kind).await {
            warn!(kind = %kind, error = %e, "refresh after write failed");
          }
          return Ok(WriteOutcome::Confirmed);
        }
        Err(err) if !err.is_transient() => return Ok(WriteOutcome::Failed(err)),
        Err(err) => debug!(kind = %kind, error = %err, "write failed in transit, queueing"),
      }
    }

    let action = self.queue.enqueue(NewAction::new(kind, operation, payload))?;
    Ok(WriteOutcome::Queued(action))
  }

  fn has_pending(&self, kind: EntityKind, payload: &Value) -> Result<bool> {
    let Some(key) = EntityKey::of_payload(kind, payload) else {
      return Ok(false);
    };
    Ok(self.queue.peek_all()?.iter().any(|a| a.entity_key() == key))
  }

  fn request_sync(&self) {
    if let Ok(slot) = self.sync.lock() {
      if let Some(trigger) = slot.as_ref() {
        trigger.request();
      }
    }
  }

  fn remember_view(&self, kind: EntityKind, range: DateRange) {
    if let Ok(mut views) = self.views.lock() {
      views.insert(kind, range);
    }
  }

  fn current_view(&self, kind: EntityKind) -> Result<Option<DateRange>> {
    let views = self.views.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(views.get(&kind).copied())
  }
}

#[async_trait]
impl Refresh for Agenda {
  /// Re-load the range last shown for `kind`, if any.
  async fn refresh(&self, kind: EntityKind) -> Result<()> {
    let Some(range) = self.current_view(kind)? else {
      return Ok(());
    };
    match kind {
      EntityKind::Event => self.load_range::<Event>(range).await.map(|_| ()),
      EntityKind::Task => self.load_range::<Task>(range).await.map(|_| ()),
    }
  }
}
