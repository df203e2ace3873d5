//! Core traits and types for the durable cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::{Record, Scope};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
  #[error("storage quota exceeded: needed {needed} bytes, {available} available")]
  QuotaExceeded { needed: u64, available: u64 },
  #[error("storage backend error: {0}")]
  Backend(String),
  #[error("corrupt cache entry '{key}': {reason}")]
  Corrupt { key: String, reason: String },
}

/// A full snapshot of one scope's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// `None` for the legacy unscoped entry.
  pub scope: Option<Scope>,
  pub payload: Vec<Record>,
  #[serde(rename = "capturedAt")]
  pub captured_at: DateTime<Utc>,
  /// When the payload was last taken from the server. Local edits carry it
  /// over unchanged.
  #[serde(rename = "fetchedAt", default, skip_serializing_if = "Option::is_none")]
  pub fetched_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  pub fn new(scope: Option<Scope>, payload: Vec<Record>) -> Self {
    Self {
      scope,
      payload,
      captured_at: Utc::now(),
      fetched_at: None,
    }
  }

  pub fn with_fetched_at(mut self, at: Option<DateTime<Utc>>) -> Self {
    self.fetched_at = at;
    self
  }

  /// Whether the entry may be served without a remote call. An entry that
  /// never came from the server is always stale.
  pub fn is_fresh(&self, window: Duration) -> bool {
    self
      .fetched_at
      .is_some_and(|at| Utc::now() - at <= window)
  }

  pub fn is_empty(&self) -> bool {
    self.payload.is_empty()
  }
}

/// Trait for one physical generation of the durable cache.
///
/// Keys are flat strings. Scope snapshots go through the entry methods;
/// everything else (tracker state, audit log, derived history) is an opaque
/// blob.
pub trait CacheStorage: Send + Sync {
  /// Short name for log lines.
  fn name(&self) -> &'static str;

  fn store_entry(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError>;

  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

  fn store_blob(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

  fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Remove a key of either kind. Missing keys are not an error.
  fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// Keys of all stored scope entries.
  fn entry_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Result from a cache-aware read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within the freshness window
  CacheFresh,
  /// Data from cache, past the freshness window; a refresh follows
  CacheStale,
  /// Network unavailable, serving cached data
  Offline,
}
