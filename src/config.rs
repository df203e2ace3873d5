use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  /// Scope (warehouse) to open when none is given on the command line
  pub default_scope: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Tracing filter used when RUST_LOG is unset (e.g. "info", "stockroom=debug")
  pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the inventory API (e.g. "https://pos.example.com/api/")
  pub url: Option<String>,
  /// Page size for list-by-scope requests
  #[serde(default = "default_page_limit")]
  pub page_limit: usize,
  /// Per-call timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      page_limit: default_page_limit(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache directory (default: $XDG_DATA_HOME/stockroom)
  pub dir: Option<PathBuf>,
  /// Capacity of the fast primary store
  #[serde(default = "default_primary_quota_bytes")]
  pub primary_quota_bytes: u64,
  /// How long a cached scope may be served without a remote call
  #[serde(default = "default_freshness_secs")]
  pub freshness_secs: u64,
  /// Derived keys that may be evicted when the primary store is full
  #[serde(default = "default_clearable_keys")]
  pub clearable_keys: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      dir: None,
      primary_quota_bytes: default_primary_quota_bytes(),
      freshness_secs: default_freshness_secs(),
      clearable_keys: default_clearable_keys(),
    }
  }
}

impl CacheConfig {
  /// Resolve the cache directory.
  pub fn dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stockroom"))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Maximum simultaneous pushes of local-only records
  #[serde(default = "default_push_concurrency")]
  pub push_concurrency: usize,
  /// Background push interval while local-only records exist
  #[serde(default = "default_push_interval_secs")]
  pub push_interval_secs: u64,
  /// Silent refresh interval while the client is active
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_undo_window_secs")]
  pub undo_window_secs: u64,
  #[serde(default = "default_undo_capacity")]
  pub undo_capacity: usize,
  /// Attempts for idempotent reads
  #[serde(default = "default_read_retries")]
  pub read_retries: usize,
  /// Resolve version conflicts by newest server timestamp without asking
  #[serde(default)]
  pub auto_last_write_wins: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      push_concurrency: default_push_concurrency(),
      push_interval_secs: default_push_interval_secs(),
      poll_interval_secs: default_poll_interval_secs(),
      undo_window_secs: default_undo_window_secs(),
      undo_capacity: default_undo_capacity(),
      read_retries: default_read_retries(),
      auto_last_write_wins: false,
    }
  }
}

fn default_page_limit() -> usize {
  500
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_primary_quota_bytes() -> u64 {
  5 * 1024 * 1024 // 5 MiB
}

fn default_freshness_secs() -> u64 {
  300
}

fn default_push_concurrency() -> usize {
  5
}

fn default_push_interval_secs() -> u64 {
  60
}

fn default_poll_interval_secs() -> u64 {
  120
}

fn default_undo_window_secs() -> u64 {
  10
}

fn default_undo_capacity() -> usize {
  5
}

fn default_read_retries() -> usize {
  3
}

/// Derived keys that are safe to drop when the primary store is full.
pub fn default_clearable_keys() -> Vec<String> {
  ["sales_history", "transaction_log", "report_cache", "sync_history"]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stockroom.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stockroom/config.yaml
  ///
  /// Every field has a default, so running without a file is allowed.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stockroom.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stockroom").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from the environment.
  ///
  /// Checks STOCKROOM_API_TOKEN. Absence is not an error; some backends are
  /// reachable without one.
  pub fn get_api_token() -> Option<String> {
    std::env::var("STOCKROOM_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
