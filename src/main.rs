use calsync::agenda::Agenda;
use calsync::api::ApiClient;
use calsync::cache::{CacheEngine, Classifier, EngineHandle, SqliteResponseStore};
use calsync::config::Config;
use calsync::connectivity::{Connectivity, ConnectivityHandle};
use calsync::logging;
use calsync::store::{LocalStore, QueueRepository};
use calsync::sync::SyncOrchestrator;
use calsync::transport::HttpTransport;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "calsync")]
#[command(about = "Offline-first sync for calendar events and tasks")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/calsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Replay queued actions once and exit
  Sync,
  /// Show queued and rejected actions
  Status,
  /// Keep draining on reconnection and on a timer until Ctrl-C
  Run,
}

struct Runtime {
  config: Config,
  store: Arc<LocalStore>,
  agenda: Agenda,
  orchestrator: Arc<SyncOrchestrator>,
  connectivity: ConnectivityHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let store_path = config.store_path()?;

  let log_dir = store_path
    .parent()
    .map(|p| p.join("logs"))
    .ok_or_else(|| eyre!("Store path has no parent: {}", store_path.display()))?;
  let _log_guard = logging::init(&log_dir)?;

  let store = Arc::new(LocalStore::open(&store_path, config.cache.version)?);

  match args.command {
    Command::Status => status(&store),
    Command::Sync => {
      let runtime = build(config, store)?;
      sync_once(&runtime).await
    }
    Command::Run => {
      let runtime = build(config, store)?;
      run(runtime).await
    }
  }
}

fn build(config: Config, store: Arc<LocalStore>) -> Result<Runtime> {
  let network = Arc::new(HttpTransport::new(config.timeout())?);
  let responses = SqliteResponseStore::open(&config.store_path()?)?;
  let engine = CacheEngine::start(
    responses,
    network,
    Classifier::new(config.cache.api_prefixes.clone()),
    config.cache.version,
  )?;
  let engine = EngineHandle::spawn(engine);

  let api = ApiClient::new(Arc::new(engine), &config.api.base_url)?;
  api.set_csrf_token(Config::csrf_token());

  // The platform reports transitions; assume reachable until told otherwise
  let connectivity =
    ConnectivityHandle::spawn(Connectivity::Online, config.sync.reconnect_debounce());

  let agenda = Agenda::new(api.clone(), store.clone(), store.clone(), connectivity.clone());
  let orchestrator = SyncOrchestrator::new(store.clone(), api)
    .with_connectivity(connectivity.clone())
    .with_refresher(Arc::new(agenda.clone()))
    .with_rejected_policy(config.sync.rejected_actions);

  Ok(Runtime {
    config,
    store,
    agenda,
    orchestrator: Arc::new(orchestrator),
    connectivity,
  })
}

fn status(store: &LocalStore) -> Result<()> {
  let pending = store.peek_all()?;
  println!("{} queued action(s)", pending.len());
  for action in &pending {
    println!(
      "  #{:<5} {:<6} {:<16} {}  {}",
      action.local_id,
      action.entity_kind,
      action.operation,
      action.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      action.payload
    );
  }

  let rejected = store.rejected()?;
  if !rejected.is_empty() {
    println!("{} rejected action(s)", rejected.len());
    for entry in &rejected {
      println!(
        "  #{:<5} {:<6} {:<16} {}",
        entry.action.local_id, entry.action.entity_kind, entry.action.operation, entry.reason
      );
    }
  }
  Ok(())
}

async fn sync_once(runtime: &Runtime) -> Result<()> {
  let report = runtime.orchestrator.drain().await?;
  println!(
    "sent {}, confirmed {}, failed {}, rejected {}, skipped {}, {} left",
    report.attempted,
    report.succeeded,
    report.failed,
    report.rejected,
    report.skipped,
    report.remaining
  );
  Ok(())
}

async fn run(runtime: Runtime) -> Result<()> {
  info!(
    online = runtime.connectivity.is_online(),
    queued = runtime.store.len()?,
    "starting background sync"
  );
  let trigger = runtime
    .orchestrator
    .clone()
    .spawn(runtime.config.sync.interval());
  runtime.agenda.attach_sync(trigger.clone());

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
  info!("shutting down");
  Ok(())
}
