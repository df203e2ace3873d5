//! Fallback cache generation: structured SQLite storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, CacheStorage, StorageError};
use crate::sync::{Record, Scope};

/// SQLite-based cache storage.
///
/// Scope snapshots are stored one row per record so the larger store stays
/// queryable; blobs go to a plain key/value table.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    add_fetched_at(&conn).map_err(|e| eyre!("Failed to migrate scope_entries: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cached scope snapshot
CREATE TABLE IF NOT EXISTS scope_entries (
    cache_key TEXT PRIMARY KEY,
    scope TEXT,
    captured_at TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    fetched_at TEXT
);

-- Records of a snapshot (preserves order)
CREATE TABLE IF NOT EXISTS scope_records (
    cache_key TEXT NOT NULL,
    identity TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    PRIMARY KEY (cache_key, identity),
    FOREIGN KEY (cache_key) REFERENCES scope_entries(cache_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_scope_records_key ON scope_records(cache_key, position);

-- Everything that is not a scope snapshot
CREATE TABLE IF NOT EXISTS blobs (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Databases created before fetch times were tracked lack the column.
fn add_fetched_at(conn: &Connection) -> rusqlite::Result<()> {
  let columns = {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('scope_entries')")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    names
  };
  if !columns.iter().any(|c| c == "fetched_at") {
    conn.execute_batch("ALTER TABLE scope_entries ADD COLUMN fetched_at TEXT")?;
  }
  Ok(())
}

fn parse_time(key: &str, text: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(text)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|e| corrupt(key, e))
}

fn map_sqlite(err: rusqlite::Error) -> StorageError {
  match &err {
    rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull => {
      StorageError::QuotaExceeded {
        needed: 0,
        available: 0,
      }
    }
    _ => StorageError::Backend(err.to_string()),
  }
}

fn corrupt(key: &str, reason: impl ToString) -> StorageError {
  StorageError::Corrupt {
    key: key.to_string(),
    reason: reason.to_string(),
  }
}

impl CacheStorage for SqliteStorage {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn store_entry(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
    let mut conn = self.lock();
    let tx = conn.transaction().map_err(map_sqlite)?;

    tx.execute("DELETE FROM scope_records WHERE cache_key = ?", params![key])
      .map_err(map_sqlite)?;

    tx.execute(
      "INSERT OR REPLACE INTO scope_entries (cache_key, scope, captured_at, record_count, fetched_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        key,
        entry.scope.as_ref().map(Scope::as_str),
        entry.captured_at.to_rfc3339(),
        entry.payload.len(),
        entry.fetched_at.map(|t| t.to_rfc3339())
      ],
    )
    .map_err(map_sqlite)?;

    for (position, record) in entry.payload.iter().enumerate() {
      let data = serde_json::to_vec(record).map_err(|e| StorageError::Backend(e.to_string()))?;
      tx.execute(
        "INSERT OR REPLACE INTO scope_records (cache_key, identity, position, data, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![key, record.id, position, data, record.updated_at.to_rfc3339()],
      )
      .map_err(map_sqlite)?;
    }

    tx.commit().map_err(map_sqlite)
  }

  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.lock();

    let header: Option<(Option<String>, String, Option<String>)> = conn
      .query_row(
        "SELECT scope, captured_at, fetched_at FROM scope_entries WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(map_sqlite)?;

    let Some((scope, captured_at, fetched_at)) = header else {
      return Ok(None);
    };
    let captured_at = parse_time(key, &captured_at)?;
    let fetched_at = fetched_at
      .map(|text| parse_time(key, &text))
      .transpose()?;

    let mut stmt = conn
      .prepare("SELECT data FROM scope_records WHERE cache_key = ? ORDER BY position")
      .map_err(map_sqlite)?;
    let rows: Vec<Vec<u8>> = stmt
      .query_map(params![key], |row| row.get(0))
      .map_err(map_sqlite)?
      .collect::<Result<_, _>>()
      .map_err(map_sqlite)?;

    let payload = rows
      .iter()
      .map(|data| serde_json::from_slice::<Record>(data))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| corrupt(key, e))?;

    Ok(Some(CacheEntry {
      scope: scope.map(Scope::new),
      payload,
      captured_at,
      fetched_at,
    }))
  }

  fn store_blob(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
    self
      .lock()
      .execute(
        "INSERT OR REPLACE INTO blobs (key, data, stored_at) VALUES (?, ?, datetime('now'))",
        params![key, data],
      )
      .map(|_| ())
      .map_err(map_sqlite)
  }

  fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    self
      .lock()
      .query_row("SELECT data FROM blobs WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(map_sqlite)
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock();
    conn
      .execute("DELETE FROM scope_entries WHERE cache_key = ?", params![key])
      .map_err(map_sqlite)?;
    conn
      .execute("DELETE FROM blobs WHERE key = ?", params![key])
      .map_err(map_sqlite)?;
    Ok(())
  }

  fn entry_keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock();
    let mut stmt = conn
      .prepare("SELECT cache_key FROM scope_entries ORDER BY cache_key")
      .map_err(map_sqlite)?;
    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(map_sqlite)?
      .collect::<Result<Vec<String>, _>>()
      .map_err(map_sqlite)?;
    Ok(keys)
  }
}
