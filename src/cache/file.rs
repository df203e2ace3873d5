//! Primary cache generation: small, quota-bounded key/value files.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::traits::{CacheEntry, CacheStorage, StorageError};

/// One file per key under a directory, with a hard byte quota across all
/// keys. Writes that would exceed the quota fail with
/// [`StorageError::QuotaExceeded`] and leave the previous value intact.
pub struct FileStorage {
  dir: PathBuf,
  quota_bytes: u64,
  write_lock: Mutex<()>,
}

impl FileStorage {
  pub fn open(dir: impl Into<PathBuf>, quota_bytes: u64) -> Result<Self, StorageError> {
    let dir = dir.into();
    fs::create_dir_all(&dir).map_err(|e| {
      StorageError::Backend(format!("Failed to create cache directory {}: {}", dir.display(), e))
    })?;
    Ok(Self {
      dir,
      quota_bytes,
      write_lock: Mutex::new(()),
    })
  }

  /// Bytes currently used by all keys.
  pub fn usage(&self) -> Result<u64, StorageError> {
    let mut total = 0;
    for entry in fs::read_dir(&self.dir).map_err(backend)? {
      let entry = entry.map_err(backend)?;
      if is_data_file(&entry.path()) {
        total += entry.metadata().map_err(backend)?.len();
      }
    }
    Ok(total)
  }

  fn path_for(&self, key: &str) -> PathBuf {
    self.dir.join(format!("{}.json", hex::encode(key.as_bytes())))
  }

  fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    let path = self.path_for(key);

    let existing = match fs::metadata(&path) {
      Ok(meta) => meta.len(),
      Err(e) if e.kind() == ErrorKind::NotFound => 0,
      Err(e) => return Err(backend(e)),
    };
    let available = self.quota_bytes.saturating_sub(self.usage()? - existing);
    let needed = data.len() as u64;
    if needed > available {
      return Err(StorageError::QuotaExceeded { needed, available });
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(backend)?;
    fs::rename(&tmp, &path).map_err(backend)?;
    debug!(key, bytes = needed, "stored key in file cache");
    Ok(())
  }

  fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(self.path_for(key)) {
      Ok(data) => Ok(Some(data)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(backend(e)),
    }
  }
}

fn is_data_file(path: &Path) -> bool {
  path.extension().is_some_and(|ext| ext == "json")
}

fn backend(err: std::io::Error) -> StorageError {
  StorageError::Backend(err.to_string())
}

impl CacheStorage for FileStorage {
  fn name(&self) -> &'static str {
    "file"
  }

  fn store_entry(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
    let data = serde_json::to_vec(entry).map_err(|e| StorageError::Backend(e.to_string()))?;
    self.write(key, &data)
  }

  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    match self.read(key)? {
      Some(data) => serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
          key: key.to_string(),
          reason: e.to_string(),
        }),
      None => Ok(None),
    }
  }

  fn store_blob(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
    self.write(key, data)
  }

  fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    self.read(key)
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    match fs::remove_file(self.path_for(key)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(backend(e)),
    }
  }

  fn entry_keys(&self) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(&self.dir).map_err(backend)? {
      let path = entry.map_err(backend)?.path();
      if !is_data_file(&path) {
        continue;
      }
      let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        continue;
      };
      let Ok(raw) = hex::decode(stem) else {
        continue;
      };
      if let Ok(key) = String::from_utf8(raw) {
        if key.starts_with("inventory") {
          keys.push(key);
        }
      }
    }
    keys.sort();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::{Record, Scope};
  use serde_json::json;

  fn entry(scope: &str, count: usize) -> CacheEntry {
    let records = (0..count)
      .map(|i| Record::from_json(format!("p{}", i), json!({"qty": i})))
      .collect();
    CacheEntry::new(Some(Scope::new(scope)), records)
  }

  #[test]
  fn test_store_and_read_entry() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), 1024 * 1024).unwrap();

    storage.store_entry("inventory:wh-1", &entry("wh-1", 3)).unwrap();
    let read = storage.get_entry("inventory:wh-1").unwrap().unwrap();
    assert_eq!(read.payload.len(), 3);
    assert_eq!(storage.entry_keys().unwrap(), vec!["inventory:wh-1"]);
  }

  #[test]
  fn test_quota_exceeded_keeps_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let small = serde_json::to_vec(&entry("wh-1", 1)).unwrap().len() as u64;
    let storage = FileStorage::open(dir.path(), small + 16).unwrap();

    storage.store_entry("inventory:wh-1", &entry("wh-1", 1)).unwrap();
    let err = storage
      .store_entry("inventory:wh-1", &entry("wh-1", 50))
      .unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { .. }));
    assert_eq!(
      storage.get_entry("inventory:wh-1").unwrap().unwrap().payload.len(),
      1
    );
  }

  #[test]
  fn test_overwrite_counts_only_the_delta() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = entry("wh-1", 5);
    let size = serde_json::to_vec(&snapshot).unwrap().len() as u64;
    let storage = FileStorage::open(dir.path(), size + 8).unwrap();

    storage.store_entry("inventory:wh-1", &snapshot).unwrap();
    storage.store_entry("inventory:wh-1", &snapshot).unwrap();
  }

  #[test]
  fn test_malformed_entry_is_reported_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), 1024).unwrap();
    storage.store_blob("inventory:wh-1", b"{not json").unwrap();

    assert!(matches!(
      storage.get_entry("inventory:wh-1"),
      Err(StorageError::Corrupt { .. })
    ));
  }

  #[test]
  fn test_remove_missing_key_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), 1024).unwrap();
    storage.store_blob("sales_history", b"[]").unwrap();
    storage.remove("sales_history").unwrap();
    storage.remove("sales_history").unwrap();
    assert!(storage.get_blob("sales_history").unwrap().is_none());
  }
}
