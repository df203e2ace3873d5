//! In-memory cache generation, used as overflow when durable stores fail.

use dashmap::DashMap;
use std::sync::Mutex;

use super::traits::{CacheEntry, CacheStorage, StorageError};

/// Keeps serialized values in a concurrent map. Optionally quota-bounded so
/// tests can stand it in for the primary store.
pub struct MemoryStorage {
  data: DashMap<String, Vec<u8>>,
  quota_bytes: Option<u64>,
  write_lock: Mutex<()>,
}

impl MemoryStorage {
  #[must_use]
  pub fn new() -> Self {
    Self {
      data: DashMap::new(),
      quota_bytes: None,
      write_lock: Mutex::new(()),
    }
  }

  #[must_use]
  pub fn with_quota(quota_bytes: u64) -> Self {
    Self {
      quota_bytes: Some(quota_bytes),
      ..Self::new()
    }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn usage(&self) -> u64 {
    self.data.iter().map(|e| e.value().len() as u64).sum()
  }

  fn write(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(quota) = self.quota_bytes {
      let existing = self.data.get(key).map(|v| v.len() as u64).unwrap_or(0);
      let available = quota.saturating_sub(self.usage() - existing);
      let needed = data.len() as u64;
      if needed > available {
        return Err(StorageError::QuotaExceeded { needed, available });
      }
    }
    self.data.insert(key.to_string(), data);
    Ok(())
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStorage for MemoryStorage {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn store_entry(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
    let data = serde_json::to_vec(entry).map_err(|e| StorageError::Backend(e.to_string()))?;
    self.write(key, data)
  }

  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    match self.data.get(key) {
      Some(data) => serde_json::from_slice(data.value())
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
          key: key.to_string(),
          reason: e.to_string(),
        }),
      None => Ok(None),
    }
  }

  fn store_blob(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
    self.write(key, data.to_vec())
  }

  fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(self.data.get(key).map(|v| v.value().clone()))
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.data.remove(key);
    Ok(())
  }

  fn entry_keys(&self) -> Result<Vec<String>, StorageError> {
    let mut keys: Vec<String> = self
      .data
      .iter()
      .map(|e| e.key().clone())
      .filter(|k| k.starts_with("inventory"))
      .collect();
    keys.sort();
    Ok(keys)
  }
}
