//! Replays queued actions against the server.
//!
//! A drain walks the queue in local id order. Each action is removed only
//! after the server acknowledged it; a failed action stays queued and blocks
//! the later actions of the same entity for the rest of the pass, while
//! independent entities keep going. Delivery is therefore at-least-once.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use futures::future;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::api::types::EntityKind;
use crate::api::ApiClient;
use crate::config::RejectedActions;
use crate::connectivity::ConnectivityHandle;
use crate::store::{EntityKey, PendingAction, QueueRepository};

/// Outcome of one or more drain passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Actions sent to the server
  pub attempted: usize,
  /// Acknowledged and removed from the queue
  pub succeeded: usize,
  /// Left queued after a transient or retryable failure
  pub failed: usize,
  /// Permanently refused by the server
  pub rejected: usize,
  /// Not attempted because an earlier action of the same entity failed
  pub skipped: usize,
  /// Queue length after the pass
  pub remaining: usize,
  /// Kinds with at least one confirmed action
  pub affected: BTreeSet<EntityKind>,
}

impl DrainReport {
  pub fn is_clean(&self) -> bool {
    self.failed == 0 && self.rejected == 0 && self.skipped == 0
  }
}

/// Re-reads a collection once its queued writes are confirmed.
#[async_trait]
pub trait Refresh: Send + Sync {
  async fn refresh(&self, kind: EntityKind) -> Result<()>;
}

/// Handle used to ask the running orchestrator for a drain.
#[derive(Clone)]
pub struct SyncTrigger {
  tx: mpsc::UnboundedSender<()>,
}

impl SyncTrigger {
  pub fn request(&self) {
    // Ignore send errors - the loop is gone and nothing is left to drain into
    let _ = self.tx.send(());
  }
}

pub struct SyncOrchestrator {
  queue: Arc<dyn QueueRepository>,
  api: ApiClient,
  connectivity: Option<ConnectivityHandle>,
  refresher: Option<Arc<dyn Refresh>>,
  rejected_policy: RejectedActions,
  draining: Mutex<()>,
  rerun: AtomicBool,
}

impl SyncOrchestrator {
  pub fn new(queue: Arc<dyn QueueRepository>, api: ApiClient) -> Self {
    Self {
      queue,
      api,
      connectivity: None,
      refresher: None,
      rejected_policy: RejectedActions::default(),
      draining: Mutex::new(()),
      rerun: AtomicBool::new(false),
    }
  }

  /// Skip drains while offline and drain on every reconnection.
  pub fn with_connectivity(mut self, connectivity: ConnectivityHandle) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  pub fn with_refresher(mut self, refresher: Arc<dyn Refresh>) -> Self {
    self.refresher = Some(refresher);
    self
  }

  pub fn with_rejected_policy(mut self, policy: RejectedActions) -> Self {
    self.rejected_policy = policy;
    self
  }

  /// Drain the queue, coalescing with a drain already in progress.
  ///
  /// If another drain is running, this only asks it to make one more pass
  /// and returns `None`. Otherwise it drains until no further pass was
  /// requested and returns the report of the last pass.
  pub async fn sync(&self) -> Result<Option<DrainReport>> {
    let mut last = None;

    loop {
      let Ok(guard) = self.draining.try_lock() else {
        self.rerun.store(true, Ordering::SeqCst);
        debug!("drain already running, queued one more pass");
        return Ok(last);
      };

      loop {
        self.rerun.store(false, Ordering::SeqCst);
        last = Some(self.drain_pass().await?);
        if !self.rerun.swap(false, Ordering::SeqCst) {
          break;
        }
      }
      drop(guard);

      // A request that raced the unlock found the guard still held
      if !self.rerun.load(Ordering::SeqCst) {
        return Ok(last);
      }
    }
  }

  /// Run one drain pass, waiting for any drain already in progress.
  ///
  /// Requests coalesced into this pass still get their follow-up pass.
  pub async fn drain(&self) -> Result<DrainReport> {
    let guard = self.draining.lock().await;
    self.rerun.store(false, Ordering::SeqCst);
    let report = self.drain_pass().await?;
    drop(guard);

    if self.rerun.load(Ordering::SeqCst) {
      self.sync().await?;
    }
    Ok(report)
  }

  fn is_offline(&self) -> bool {
    self
      .connectivity
      .as_ref()
      .is_some_and(|c| !c.is_online())
  }

  async fn drain_pass(&self) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    if self.is_offline() {
      report.remaining = self.queue.len()?;
      debug!(remaining = report.remaining, "offline, not draining");
      return Ok(report);
    }

    let actions = self.queue.peek_all()?;
    if actions.is_empty() {
      return Ok(report);
    }
    info!(count = actions.len(), "draining pending actions");

    let mut blocked: HashSet<EntityKey> = HashSet::new();

    for action in actions {
      let key = action.entity_key();
      if blocked.contains(&key) {
        report.skipped += 1;
        continue;
      }
      if self.is_offline() {
        debug!(local_id = action.local_id, "connection lost mid-drain, stopping");
        break;
      }

      report.attempted += 1;
      match self
        .api
        .submit(action.entity_kind, action.operation, &action.payload)
        .await
      {
        Ok(()) => {
          // Acknowledged; only now may it leave the queue
          self.queue.dequeue(action.local_id)?;
          report.succeeded += 1;
          report.affected.insert(action.entity_kind);
        }
        Err(err) if err.is_permanent() => {
          blocked.insert(key);
          report.rejected += 1;
          self.handle_rejection(&action, &err.to_string())?;
        }
        Err(err) => {
          blocked.insert(key);
          report.failed += 1;
          debug!(local_id = action.local_id, error = %err, "action left queued");
        }
      }
    }

    report.remaining = self.queue.len()?;

    if report.is_clean() {
      info!(succeeded = report.succeeded, "drain complete");
    } else {
      warn!(
        succeeded = report.succeeded,
        failed = report.failed,
        rejected = report.rejected,
        skipped = report.skipped,
        remaining = report.remaining,
        "drain left actions queued"
      );
    }

    self.refresh_affected(&report).await;
    Ok(report)
  }

  fn handle_rejection(&self, action: &PendingAction, reason: &str) -> Result<()> {
    match self.rejected_policy {
      RejectedActions::Keep => {
        warn!(
          local_id = action.local_id,
          kind = %action.entity_kind,
          operation = %action.operation,
          reason,
          "server refused queued action, keeping it queued"
        );
      }
      RejectedActions::DeadLetter => {
        warn!(
          local_id = action.local_id,
          kind = %action.entity_kind,
          operation = %action.operation,
          reason,
          "server refused queued action, moving it out of the queue"
        );
        self.queue.dead_letter(action.local_id, reason)?;
      }
    }
    Ok(())
  }

  async fn refresh_affected(&self, report: &DrainReport) {
    let Some(refresher) = &self.refresher else {
      return;
    };
    for kind in &report.affected {
      if let Err(e) = refresher.refresh(*kind).await {
        warn!(kind = %kind, error = %e, "refresh after drain failed");
      }
    }
  }

  /// Run the trigger loop on its own task.
  ///
  /// Drains on every reconnection, on every [`SyncTrigger::request`], and
  /// every `interval` if one is given (the first tick fires immediately).
  /// The loop stops once every [`SyncTrigger`] is dropped.
  pub fn spawn(self: Arc<Self>, interval: Option<Duration>) -> SyncTrigger {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(self.run_loop(rx, interval));
    SyncTrigger { tx }
  }

  async fn run_loop(self: Arc<Self>, mut manual: mpsc::UnboundedReceiver<()>, interval: Option<Duration>) {
    let mut reconnected = self
      .connectivity
      .as_ref()
      .map(ConnectivityHandle::subscribe_reconnected);
    let mut ticker = interval.map(tokio::time::interval);

    loop {
      let reason = tokio::select! {
        signal = async {
          match reconnected.as_mut() {
            Some(rx) => rx.recv().await,
            None => future::pending().await,
          }
        } => match signal {
          Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => "reconnected",
          Err(broadcast::error::RecvError::Closed) => {
            reconnected = None;
            continue;
          }
        },
        request = manual.recv() => match request {
          Some(()) => "manual",
          None => break,
        },
        _ = async {
          match ticker.as_mut() {
            Some(t) => {
              t.tick().await;
            }
            None => future::pending::<()>().await,
          }
        } => "interval",
      };

      debug!(reason, "sync triggered");
      if let Err(e) = self.sync().await {
        error!(error = %e, "drain aborted");
      }
    }
    debug!("sync loop stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Operation;
  use crate::connectivity::Connectivity;
  use crate::store::{LocalStore, NewAction};
  use crate::testing::ScriptedTransport;
  use serde_json::{json, Value};
  use std::sync::Mutex as StdMutex;

  struct Setup {
    store: Arc<LocalStore>,
    network: Arc<ScriptedTransport>,
    orchestrator: SyncOrchestrator,
  }

  fn setup() -> Setup {
    let store = Arc::new(LocalStore::open_in_memory(1).unwrap());
    let network = Arc::new(ScriptedTransport::new());
    network.respond_ok("/api/", r#"{"success":true}"#);
    let api = ApiClient::new(network.clone(), "https://h/api").unwrap();
    let orchestrator = SyncOrchestrator::new(store.clone(), api);
    Setup {
      store,
      network,
      orchestrator,
    }
  }

  fn queue(store: &LocalStore, kind: EntityKind, operation: Operation, payload: Value) -> i64 {
    store
      .enqueue(NewAction::new(kind, operation, payload))
      .unwrap()
      .local_id
  }

  #[tokio::test]
  async fn test_fifo_replay() {
    let s = setup();
    for n in 0..5 {
      queue(&s.store, EntityKind::Event, Operation::Create, json!({ "seq": n }));
    }
    queue(&s.store, EntityKind::Task, Operation::Update, json!({ "id": 1, "seq": 5 }));

    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.succeeded, 6);
    assert_eq!(report.remaining, 0);

    let sequence: Vec<i64> = s
      .network
      .write_bodies()
      .iter()
      .map(|b| b["seq"].as_i64().unwrap())
      .collect();
    assert_eq!(sequence, [0, 1, 2, 3, 4, 5]);
  }

  #[tokio::test]
  async fn test_failure_blocks_only_same_entity() {
    let s = setup();
    s.network
      .fail_when_body_contains("/api/task-api", r#""step":1"#);

    queue(&s.store, EntityKind::Task, Operation::Update, json!({"id": 7, "step": 1}));
    queue(&s.store, EntityKind::Task, Operation::Update, json!({"id": 7, "step": 2}));
    queue(&s.store, EntityKind::Task, Operation::Update, json!({"id": 8, "step": 3}));

    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.succeeded, 1);

    // Step 2 was never sent ahead of step 1
    let steps: Vec<i64> = s
      .network
      .write_bodies()
      .iter()
      .map(|b| b["step"].as_i64().unwrap())
      .collect();
    assert_eq!(steps, [1, 3]);

    let left: Vec<i64> = s
      .store
      .peek_all()
      .unwrap()
      .iter()
      .map(|a| a.payload["step"].as_i64().unwrap())
      .collect();
    assert_eq!(left, [1, 2]);
  }

  #[tokio::test]
  async fn test_nothing_dequeued_without_ack() {
    let s = setup();
    s.network.go_offline();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"a": 1}));
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"b": 2}));

    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(s.store.len().unwrap(), 2);

    // Next cycle retries each leftover action exactly once
    s.network.go_online();
    let before = s.network.calls().len();
    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(s.network.calls().len() - before, 2);
    assert!(s.store.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_rejected_action_kept_by_default() {
    let s = setup();
    s.network.respond_when_body_contains(
      "/api/calendar-events",
      "bad",
      422,
      r#"{"success":false,"error":"invalid"}"#,
    );
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"title": "bad"}));

    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(s.store.len().unwrap(), 1);
    assert!(s.store.rejected().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_rejected_action_dead_lettered() {
    let s = setup();
    s.network.respond_when_body_contains(
      "/api/calendar-events",
      "bad",
      400,
      r#"{"success":false,"error":"invalid"}"#,
    );
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"title": "bad"}));
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"title": "good"}));

    let orchestrator = s
      .orchestrator
      .with_rejected_policy(RejectedActions::DeadLetter);
    let report = orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.succeeded, 1);
    assert!(s.store.is_empty().unwrap());
    assert_eq!(s.store.rejected().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_retryable_server_error_stays_queued() {
    let s = setup();
    s.network.respond("/api/calendar-events", 503, "");
    queue(&s.store, EntityKind::Event, Operation::Create, json!({}));

    let report = s.orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.rejected, 0);
    assert_eq!(s.store.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_skips_while_offline() {
    let s = setup();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({}));
    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, Duration::from_millis(10));
    let orchestrator = s.orchestrator.with_connectivity(monitor);

    let report = orchestrator.sync().await.unwrap().unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.remaining, 1);
    assert!(s.network.calls().is_empty());
  }

  struct RecordingRefresh {
    kinds: StdMutex<Vec<EntityKind>>,
  }

  #[async_trait]
  impl Refresh for RecordingRefresh {
    async fn refresh(&self, kind: EntityKind) -> Result<()> {
      self.kinds.lock().unwrap().push(kind);
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_refreshes_affected_kinds() {
    let s = setup();
    let refresher = Arc::new(RecordingRefresh {
      kinds: StdMutex::new(Vec::new()),
    });
    queue(&s.store, EntityKind::Task, Operation::Create, json!({}));
    queue(&s.store, EntityKind::Task, Operation::Create, json!({}));

    let orchestrator = s.orchestrator.with_refresher(refresher.clone());
    orchestrator.sync().await.unwrap();
    assert_eq!(*refresher.kinds.lock().unwrap(), vec![EntityKind::Task]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnection_triggers_drain() {
    let s = setup();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"title": "Audit"}));

    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, Duration::from_millis(100));
    let orchestrator = Arc::new(s.orchestrator.with_connectivity(monitor.clone()));
    let _trigger = orchestrator.spawn(None);

    monitor.report(Connectivity::Online);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(s.store.is_empty().unwrap());
    assert_eq!(s.network.write_bodies(), vec![json!({"title": "Audit"})]);
  }

  #[tokio::test]
  async fn test_drain_waits_for_running_pass() {
    let s = setup();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({}));
    let orchestrator = Arc::new(s.orchestrator);

    let running = {
      let orchestrator = orchestrator.clone();
      tokio::spawn(async move { orchestrator.sync().await })
    };
    let report = orchestrator.drain().await.unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(report.remaining, 0);
    assert_eq!(s.network.write_bodies().len(), 1);
  }

  #[tokio::test]
  async fn test_manual_trigger() {
    let s = setup();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({}));

    let trigger = Arc::new(s.orchestrator).spawn(None);
    trigger.request();

    for _ in 0..50 {
      if s.store.is_empty().unwrap() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(s.store.is_empty().unwrap());
  }

  /// Enqueues one more action and asks for a sync while the first drain runs.
  struct RequeueOnRefresh {
    store: Arc<LocalStore>,
    orchestrator: std::sync::OnceLock<std::sync::Weak<SyncOrchestrator>>,
    fired: AtomicBool,
  }

  #[async_trait]
  impl Refresh for RequeueOnRefresh {
    async fn refresh(&self, _kind: EntityKind) -> Result<()> {
      if self.fired.swap(true, Ordering::SeqCst) {
        return Ok(());
      }
      self
        .store
        .enqueue(NewAction::new(EntityKind::Event, Operation::Create, json!({"late": true})))?;
      let orchestrator = self.orchestrator.get().and_then(|o| o.upgrade());
      if let Some(orchestrator) = orchestrator {
        assert!(orchestrator.sync().await?.is_none());
      }
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_sync_requested_during_drain_gets_another_pass() {
    let s = setup();
    queue(&s.store, EntityKind::Event, Operation::Create, json!({"early": true}));

    let hook = Arc::new(RequeueOnRefresh {
      store: s.store.clone(),
      orchestrator: std::sync::OnceLock::new(),
      fired: AtomicBool::new(false),
    });
    let orchestrator = Arc::new(s.orchestrator.with_refresher(hook.clone()));
    hook.orchestrator.set(Arc::downgrade(&orchestrator)).unwrap();

    orchestrator.drain().await.unwrap();

    assert!(s.store.is_empty().unwrap());
    assert_eq!(
      s.network.write_bodies(),
      vec![json!({"early": true}), json!({"late": true})]
    );
  }
}

