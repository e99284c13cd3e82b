//! Online/offline signal driven by platform network events.
//!
//! The platform pushes transitions with [`ConnectivityHandle::report`]; the
//! monitor task keeps the current state in a watch channel and broadcasts a
//! single `reconnected` notification once an `offline -> online` transition
//! has held for the debounce window. Nothing is polled.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Clone + Send + Sync handle to the connectivity monitor.
#[derive(Clone)]
pub struct ConnectivityHandle {
  events: mpsc::UnboundedSender<Connectivity>,
  state: watch::Receiver<Connectivity>,
  reconnected: broadcast::Sender<()>,
}

impl ConnectivityHandle {
  /// Start the monitor with the platform's status at startup.
  pub fn spawn(initial: Connectivity, debounce: Duration) -> Self {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(initial);
    let (reconnected_tx, _) = broadcast::channel(16);

    tokio::spawn(run_loop(
      events_rx,
      state_tx,
      reconnected_tx.clone(),
      debounce,
    ));

    Self {
      events: events_tx,
      state: state_rx,
      reconnected: reconnected_tx,
    }
  }

  /// Push a platform-reported network transition.
  pub fn report(&self, status: Connectivity) {
    // Ignore send errors - the monitor only stops when the runtime does
    let _ = self.events.send(status);
  }

  pub fn current(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  pub fn subscribe_state(&self) -> watch::Receiver<Connectivity> {
    self.state.clone()
  }

  /// Receive one `()` per stabilized reconnection.
  pub fn subscribe_reconnected(&self) -> broadcast::Receiver<()> {
    self.reconnected.subscribe()
  }
}

async fn run_loop(
  mut events: mpsc::UnboundedReceiver<Connectivity>,
  state: watch::Sender<Connectivity>,
  reconnected: broadcast::Sender<()>,
  debounce: Duration,
) {
  // Set while an offline -> online transition is waiting to settle
  let mut deadline: Option<Instant> = None;

  loop {
    let wake = deadline;
    tokio::select! {
      event = events.recv() => {
        let Some(next) = event else { break };
        let previous = *state.borrow();
        if next == previous {
          continue;
        }
        state.send_replace(next);
        debug!(?previous, ?next, "connectivity changed");

        deadline = match next {
          Connectivity::Online => Some(Instant::now() + debounce),
          Connectivity::Offline => None,
        };
      }
      _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
        deadline = None;
        if *state.borrow() == Connectivity::Online {
          info!("network connection restored");
          // No subscribers is fine
          let _ = reconnected.send(());
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::broadcast::error::TryRecvError;

  const DEBOUNCE: Duration = Duration::from_millis(500);

  async fn settle() {
    // Let the monitor task drain its channel
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_initial_state() {
    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, DEBOUNCE);
    assert!(!monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_emits_once_after_debounce() {
    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, DEBOUNCE);
    let mut reconnected = monitor.subscribe_reconnected();

    monitor.report(Connectivity::Online);
    settle().await;
    assert!(monitor.is_online());
    assert_eq!(reconnected.try_recv(), Err(TryRecvError::Empty));

    tokio::time::sleep(DEBOUNCE * 2).await;
    assert_eq!(reconnected.try_recv(), Ok(()));
    assert_eq!(reconnected.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test(start_paused = true)]
  async fn test_flapping_collapses_to_one_emission() {
    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, DEBOUNCE);
    let mut reconnected = monitor.subscribe_reconnected();

    for _ in 0..5 {
      monitor.report(Connectivity::Online);
      settle().await;
      tokio::time::sleep(DEBOUNCE / 5).await;
      monitor.report(Connectivity::Offline);
      settle().await;
    }
    monitor.report(Connectivity::Online);
    settle().await;
    tokio::time::sleep(DEBOUNCE * 2).await;

    assert_eq!(reconnected.try_recv(), Ok(()));
    assert_eq!(reconnected.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_before_settle_emits_nothing() {
    let monitor = ConnectivityHandle::spawn(Connectivity::Offline, DEBOUNCE);
    let mut reconnected = monitor.subscribe_reconnected();

    monitor.report(Connectivity::Online);
    settle().await;
    monitor.report(Connectivity::Offline);
    settle().await;
    tokio::time::sleep(DEBOUNCE * 2).await;

    assert_eq!(reconnected.try_recv(), Err(TryRecvError::Empty));
    assert!(!monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_online_reports_are_not_transitions() {
    let monitor = ConnectivityHandle::spawn(Connectivity::Online, DEBOUNCE);
    let mut reconnected = monitor.subscribe_reconnected();

    monitor.report(Connectivity::Online);
    settle().await;
    tokio::time::sleep(DEBOUNCE * 2).await;

    assert_eq!(reconnected.try_recv(), Err(TryRecvError::Empty));
  }
}
