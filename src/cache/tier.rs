//! Durable cache tier: primary store, structured fallback, memory overflow.

use chrono::Utc;
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::file::FileStorage;
use super::memory::MemoryStorage;
use super::storage::SqliteStorage;
use super::traits::{CacheEntry, CacheStorage, StorageError};
use crate::config::CacheConfig;
use crate::sync::{Record, Scope, LEGACY_CACHE_KEY};

/// Which generation ended up holding a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  Primary,
  Fallback,
  /// Not durable: lost on reload.
  Memory,
}

/// Result of a durable write. `ok` is false only when the value could not be
/// made durable anywhere and lives in memory alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
  pub ok: bool,
  pub tier: Tier,
  /// Clearable keys freed to make room.
  pub evicted: Vec<String>,
}

/// Scoped key/value persistence that survives reloads.
///
/// Writes never fail loudly: on capacity exhaustion the clearable keys are
/// evicted and the write retried once, then the fallback store is tried, and
/// only then does the value land in memory with `ok = false`.
pub struct DurableCache {
  primary: Box<dyn CacheStorage>,
  fallback: Option<Box<dyn CacheStorage>>,
  overflow: MemoryStorage,
  clearable: Vec<String>,
  persist_failed: AtomicBool,
}

impl DurableCache {
  pub fn new(
    primary: Box<dyn CacheStorage>,
    fallback: Option<Box<dyn CacheStorage>>,
    clearable: Vec<String>,
  ) -> Self {
    Self {
      primary,
      fallback,
      overflow: MemoryStorage::new(),
      clearable,
      persist_failed: AtomicBool::new(false),
    }
  }

  /// Open the on-disk generations described by `config`.
  pub fn open(config: &CacheConfig) -> Result<Self> {
    let dir = config.dir()?;
    let primary = FileStorage::open(dir.join("primary"), config.primary_quota_bytes)?;
    let fallback = SqliteStorage::open(&dir.join("cache.db"))?;
    info!(dir = %dir.display(), "opened durable cache");
    Ok(Self::new(
      Box::new(primary),
      Some(Box::new(fallback)),
      config.clearable_keys.clone(),
    ))
  }

  /// Memory-only cache, for tests and ephemeral sessions.
  pub fn in_memory() -> Self {
    Self::new(
      Box::new(MemoryStorage::new()),
      None,
      crate::config::default_clearable_keys(),
    )
  }

  /// Whether the most recent critical write could not be made durable.
  pub fn storage_persist_failed(&self) -> bool {
    self.persist_failed.load(Ordering::SeqCst)
  }

  pub fn clearable_keys(&self) -> &[String] {
    &self.clearable
  }

  /// Persist the full record list for `scope` after a local change. The
  /// time of the last server fetch is kept.
  pub fn write(&self, scope: &Scope, records: &[Record]) -> PersistOutcome {
    let key = scope.cache_key();
    let fetched_at = self.read_entry(&key).and_then(|e| e.fetched_at);
    let entry = CacheEntry::new(Some(scope.clone()), records.to_vec()).with_fetched_at(fetched_at);
    self.write_entry(&key, &entry)
  }

  /// Persist a record list for `scope` that was just read from the server.
  pub fn write_fetched(&self, scope: &Scope, records: &[Record]) -> PersistOutcome {
    let entry =
      CacheEntry::new(Some(scope.clone()), records.to_vec()).with_fetched_at(Some(Utc::now()));
    self.write_entry(&scope.cache_key(), &entry)
  }

  /// Persist the legacy unscoped entry.
  pub fn write_legacy(&self, records: &[Record]) -> PersistOutcome {
    let entry = CacheEntry::new(None, records.to_vec());
    self.write_entry(LEGACY_CACHE_KEY, &entry)
  }

  /// Records cached for `scope`; unreadable or malformed data reads as empty.
  pub fn read(&self, scope: &Scope) -> Vec<Record> {
    self
      .read_entry(&scope.cache_key())
      .map(|e| e.payload)
      .unwrap_or_default()
  }

  /// Newest copy of the entry across all generations.
  pub fn read_entry(&self, key: &str) -> Option<CacheEntry> {
    self
      .generations()
      .into_iter()
      .filter_map(|storage| match storage.get_entry(key) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(storage = storage.name(), key, error = %e, "treating unreadable cache entry as empty");
          None
        }
      })
      .max_by_key(|entry| entry.captured_at)
  }

  /// Every scoped entry known to any generation, newest copy per key.
  pub fn scoped_entries(&self) -> Vec<CacheEntry> {
    let mut keys: Vec<String> = self
      .generations()
      .into_iter()
      .flat_map(|storage| match storage.entry_keys() {
        Ok(keys) => keys,
        Err(e) => {
          warn!(storage = storage.name(), error = %e, "failed to list cache keys");
          Vec::new()
        }
      })
      .filter(|key| Scope::from_cache_key(key).is_some())
      .collect();
    keys.sort();
    keys.dedup();

    keys.iter().filter_map(|key| self.read_entry(key)).collect()
  }

  /// Persist a non-snapshot value. Clearable keys are never critical.
  pub fn write_blob(&self, key: &str, data: &[u8]) -> PersistOutcome {
    let critical = !self.is_clearable(key);
    self.persist(key, critical, |storage| storage.store_blob(key, data))
  }

  pub fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
    for storage in self.generations() {
      match storage.get_blob(key) {
        Ok(Some(data)) => return Some(data),
        Ok(None) => {}
        Err(e) => warn!(storage = storage.name(), key, error = %e, "failed to read cache blob"),
      }
    }
    None
  }

  /// Remove keys from every generation.
  pub fn evict(&self, keys: &[&str]) {
    for key in keys {
      for storage in self.generations() {
        if let Err(e) = storage.remove(key) {
          warn!(storage = storage.name(), key, error = %e, "failed to evict cache key");
        }
      }
    }
  }

  fn is_clearable(&self, key: &str) -> bool {
    self.clearable.iter().any(|k| k == key)
  }

  fn generations(&self) -> Vec<&dyn CacheStorage> {
    let mut out: Vec<&dyn CacheStorage> = vec![self.primary.as_ref()];
    if let Some(fallback) = &self.fallback {
      out.push(fallback.as_ref());
    }
    out.push(&self.overflow);
    out
  }

  fn write_entry(&self, key: &str, entry: &CacheEntry) -> PersistOutcome {
    self.persist(key, true, |storage| storage.store_entry(key, entry))
  }

  fn evict_clearable(&self, except: &str) -> Vec<String> {
    let mut evicted = Vec::new();
    for key in self.clearable.iter().filter(|k| k.as_str() != except) {
      match self.primary.get_blob(key) {
        Ok(Some(_)) => {}
        _ => continue,
      }
      if self.primary.remove(key).is_ok() {
        evicted.push(key.clone());
      }
    }
    if !evicted.is_empty() {
      info!(keys = ?evicted, "evicted clearable cache keys to free space");
    }
    evicted
  }

  fn persist<F>(&self, key: &str, critical: bool, store: F) -> PersistOutcome
  where
    F: Fn(&dyn CacheStorage) -> Result<(), StorageError>,
  {
    let mut evicted = Vec::new();

    let mut result = store(self.primary.as_ref());
    if let Err(StorageError::QuotaExceeded { .. }) = result {
      if critical {
        evicted = self.evict_clearable(key);
        result = store(self.primary.as_ref());
      }
    }

    let tier = match result {
      Ok(()) => Some(Tier::Primary),
      Err(e) => {
        warn!(key, error = %e, "primary cache write failed");
        match &self.fallback {
          Some(fallback) => match store(fallback.as_ref()) {
            Ok(()) => {
              info!(key, "stored in fallback cache");
              Some(Tier::Fallback)
            }
            Err(e) => {
              warn!(key, error = %e, "fallback cache write failed");
              None
            }
          },
          None => None,
        }
      }
    };

    match tier {
      Some(tier) => {
        if let Err(e) = self.overflow.remove(key) {
          debug!(key, error = %e, "failed to drop overflow copy");
        }
        if critical {
          self.persist_failed.store(false, Ordering::SeqCst);
        }
        PersistOutcome {
          ok: true,
          tier,
          evicted,
        }
      }
      None => {
        if let Err(e) = store(&self.overflow) {
          warn!(key, error = %e, "failed to keep value in memory");
        }
        if critical {
          self.persist_failed.store(true, Ordering::SeqCst);
        }
        warn!(key, "value is held in memory only and will not survive a reload");
        PersistOutcome {
          ok: false,
          tier: Tier::Memory,
          evicted,
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn records(count: usize) -> Vec<Record> {
    (0..count)
      .map(|i| Record::from_json(format!("p{}", i), json!({"name": "Red Shoe", "qty": i})))
      .collect()
  }

  fn bounded(quota: u64, fallback: Option<Box<dyn CacheStorage>>) -> DurableCache {
    DurableCache::new(
      Box::new(MemoryStorage::with_quota(quota)),
      fallback,
      vec!["sales_history".into(), "transaction_log".into()],
    )
  }

  #[test]
  fn test_write_then_read() {
    let cache = DurableCache::in_memory();
    let scope = Scope::new("wh-1");
    let outcome = cache.write(&scope, &records(3));
    assert!(outcome.ok);
    assert_eq!(outcome.tier, Tier::Primary);
    assert_eq!(cache.read(&scope).len(), 3);
  }

  #[test]
  fn test_local_write_keeps_fetch_time() {
    let cache = DurableCache::in_memory();
    let scope = Scope::new("wh-1");
    assert!(cache.write(&scope, &records(1)).ok);
    assert_eq!(cache.read_entry(&scope.cache_key()).unwrap().fetched_at, None);

    cache.write_fetched(&scope, &records(2));
    let fetched = cache.read_entry(&scope.cache_key()).unwrap().fetched_at;
    assert!(fetched.is_some());

    cache.write(&scope, &records(3));
    let entry = cache.read_entry(&scope.cache_key()).unwrap();
    assert_eq!(entry.payload.len(), 3);
    assert_eq!(entry.fetched_at, fetched);
  }

  #[test]
  fn test_quota_evicts_clearable_keys_and_retries() {
    let cache = bounded(4096, None);
    let scope = Scope::new("wh-1");
    assert!(cache.write_blob("sales_history", &vec![b'x'; 3500]).ok);

    let outcome = cache.write(&scope, &records(10));
    assert!(outcome.ok);
    assert_eq!(outcome.tier, Tier::Primary);
    assert_eq!(outcome.evicted, vec!["sales_history".to_string()]);
    assert!(!cache.storage_persist_failed());
    assert!(cache.read_blob("sales_history").is_none());
  }

  #[test]
  fn test_falls_back_to_structured_store() {
    let fallback = SqliteStorage::open_in_memory().unwrap();
    let cache = bounded(64, Some(Box::new(fallback)));
    let scope = Scope::new("wh-1");

    let outcome = cache.write(&scope, &records(10));
    assert!(outcome.ok);
    assert_eq!(outcome.tier, Tier::Fallback);
    assert_eq!(cache.read(&scope).len(), 10);
  }

  #[test]
  fn test_memory_overflow_flags_persist_failure() {
    let cache = bounded(128, None);
    let scope = Scope::new("wh-1");

    let outcome = cache.write(&scope, &records(10));
    assert!(!outcome.ok);
    assert_eq!(outcome.tier, Tier::Memory);
    assert!(cache.storage_persist_failed());
    assert_eq!(cache.read(&scope).len(), 10);

    assert!(cache.write(&scope, &[]).ok);
    assert!(!cache.storage_persist_failed());
  }

  #[test]
  fn test_clearable_blob_failure_is_not_critical() {
    let cache = bounded(16, None);
    let outcome = cache.write_blob("sales_history", &[0u8; 64]);
    assert!(!outcome.ok);
    assert!(!cache.storage_persist_failed());
  }

  #[test]
  fn test_corrupt_entry_reads_as_empty() {
    let cache = DurableCache::in_memory();
    let scope = Scope::new("wh-1");
    cache.write_blob(&scope.cache_key(), b"not json");
    assert!(cache.read(&scope).is_empty());
  }

  #[test]
  fn test_scoped_entries_skip_legacy_and_blobs() {
    let cache = DurableCache::in_memory();
    cache.write(&Scope::new("wh-1"), &records(1));
    cache.write(&Scope::new("wh-2"), &records(2));
    cache.write_legacy(&records(5));
    cache.write_blob("local_only", b"{}");

    let entries = cache.scoped_entries();
    assert_eq!(entries.len(), 2);
  }
}
