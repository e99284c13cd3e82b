use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL the endpoint paths are joined onto (e.g. "https://example.org/api/")
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Bumping this drops every cached response and record (never queued actions)
  #[serde(default = "default_cache_version")]
  pub version: u32,
  /// Path fragments that identify calendar/task endpoints
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      api_prefixes: default_api_prefixes(),
    }
  }
}

/// What to do with a queued action the server refuses for good
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectedActions {
  /// Leave it queued; it is retried on every drain
  #[default]
  Keep,
  /// Move it to the rejected table
  DeadLetter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Background drain period; 0 disables periodic drains
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
  #[serde(default = "default_debounce_ms")]
  pub reconnect_debounce_ms: u64,
  #[serde(default)]
  pub rejected_actions: RejectedActions,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
      reconnect_debounce_ms: default_debounce_ms(),
      rejected_actions: RejectedActions::default(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Option<Duration> {
    (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
  }

  pub fn reconnect_debounce(&self) -> Duration {
    Duration::from_millis(self.reconnect_debounce_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/calsync/store.db)
  pub path: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_cache_version() -> u32 {
  1
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/calendar-events".to_string(), "/task-api".to_string()]
}

fn default_interval_secs() -> u64 {
  300
}

fn default_debounce_ms() -> u64 {
  2000
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./calsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/calsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/calsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("calsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("calsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Resolved database path
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => crate::store::LocalStore::default_path(),
    }
  }

  /// Get the CSRF token from the environment, if the caller supplied one.
  ///
  /// Checks CALSYNC_CSRF_TOKEN.
  pub fn csrf_token() -> Option<String> {
    std::env::var("CALSYNC_CSRF_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
