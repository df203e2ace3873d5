//! In-process authoritative store with fault injection.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{RemoteError, RemoteStore, WriteAck};
use crate::sync::{Record, Scope};

type Key = (String, String);

/// Authoritative store kept in memory.
///
/// Behaves like the HTTP backend: it assigns versions and timestamps,
/// deduplicates creates by idempotency token and rejects stale updates. The
/// switches let tests take it offline, drop full-record responses, fail
/// verification reads or silently ignore deletes.
pub struct MemoryRemoteStore {
  records: DashMap<Key, Record>,
  tokens: DashMap<String, Key>,
  online: AtomicBool,
  ack_only: AtomicBool,
  fail_reads: AtomicBool,
  ignore_deletes: AtomicBool,
  empty_lists: AtomicBool,
  latency_ms: AtomicU64,
  create_calls: AtomicUsize,
}

impl MemoryRemoteStore {
  #[must_use]
  pub fn new() -> Self {
    Self {
      records: DashMap::new(),
      tokens: DashMap::new(),
      online: AtomicBool::new(true),
      ack_only: AtomicBool::new(false),
      fail_reads: AtomicBool::new(false),
      ignore_deletes: AtomicBool::new(false),
      empty_lists: AtomicBool::new(false),
      latency_ms: AtomicU64::new(0),
      create_calls: AtomicUsize::new(0),
    }
  }

  /// Seed a record directly, bypassing versioning.
  pub fn insert(&self, scope: &Scope, record: Record) {
    self.records.insert(key(scope, &record.id), record);
  }

  /// Current server copy of `identity`, ignoring injected faults.
  pub fn record(&self, scope: &Scope, identity: &str) -> Option<Record> {
    self.records.get(&key(scope, identity)).map(|r| r.value().clone())
  }

  /// All records in `scope`, ordered by identity.
  pub fn records(&self, scope: &Scope) -> Vec<Record> {
    let mut out: Vec<Record> = self
      .records
      .iter()
      .filter(|entry| entry.key().0 == scope.as_str())
      .map(|entry| entry.value().clone())
      .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
  }

  pub fn len(&self, scope: &Scope) -> usize {
    self
      .records
      .iter()
      .filter(|entry| entry.key().0 == scope.as_str())
      .count()
  }

  pub fn is_empty(&self, scope: &Scope) -> bool {
    self.len(scope) == 0
  }

  /// Number of create calls received, including deduplicated ones.
  pub fn create_calls(&self) -> usize {
    self.create_calls.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Answer writes with a bare acknowledgement instead of the full record.
  pub fn set_ack_only(&self, ack_only: bool) {
    self.ack_only.store(ack_only, Ordering::SeqCst);
  }

  /// Make single-record reads fail with a network error.
  pub fn set_fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Accept deletes without removing anything.
  pub fn set_ignore_deletes(&self, ignore: bool) {
    self.ignore_deletes.store(ignore, Ordering::SeqCst);
  }

  /// Answer list calls with an empty page, as a broken backend would.
  pub fn set_empty_lists(&self, empty: bool) {
    self.empty_lists.store(empty, Ordering::SeqCst);
  }

  /// Delay every call by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    self
      .latency_ms
      .store(latency.as_millis() as u64, Ordering::SeqCst);
  }

  async fn gate(&self) -> Result<(), RemoteError> {
    let latency = self.latency_ms.load(Ordering::SeqCst);
    if latency > 0 {
      tokio::time::sleep(Duration::from_millis(latency)).await;
    }
    if !self.online.load(Ordering::SeqCst) {
      return Err(RemoteError::Network("remote store unreachable".into()));
    }
    Ok(())
  }

  fn respond(&self, record: Record) -> WriteAck {
    if self.ack_only.load(Ordering::SeqCst) {
      WriteAck::Acknowledged
    } else {
      WriteAck::Record(record)
    }
  }
}

impl Default for MemoryRemoteStore {
  fn default() -> Self {
    Self::new()
  }
}

fn key(scope: &Scope, identity: &str) -> Key {
  (scope.as_str().to_string(), identity.to_string())
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
  async fn list(&self, scope: &Scope, limit: usize) -> Result<Vec<Record>, RemoteError> {
    self.gate().await?;
    if self.empty_lists.load(Ordering::SeqCst) {
      return Ok(Vec::new());
    }
    let mut records = self.records(scope);
    records.truncate(limit);
    Ok(records)
  }

  async fn get(&self, scope: &Scope, identity: &str) -> Result<Option<Record>, RemoteError> {
    self.gate().await?;
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(RemoteError::Network("read failed".into()));
    }
    Ok(self.record(scope, identity))
  }

  async fn create(
    &self,
    scope: &Scope,
    record: &Record,
    idempotency_token: &str,
  ) -> Result<WriteAck, RemoteError> {
    self.create_calls.fetch_add(1, Ordering::SeqCst);
    self.gate().await?;

    if let Some(existing) = self.tokens.get(idempotency_token) {
      if let Some(stored) = self.records.get(existing.value()) {
        return Ok(self.respond(stored.value().clone()));
      }
    }

    let k = key(scope, &record.id);
    if let Some(existing) = self.records.get(&k) {
      return Err(RemoteError::Conflict {
        identity: record.id.clone(),
        server_version: existing.version,
      });
    }

    let mut stored = record.clone();
    stored.version = Some(1);
    stored.updated_at = Utc::now();
    self.records.insert(k.clone(), stored.clone());
    self.tokens.insert(idempotency_token.to_string(), k);
    Ok(self.respond(stored))
  }

  async fn update(
    &self,
    scope: &Scope,
    record: &Record,
    known_version: Option<u64>,
  ) -> Result<WriteAck, RemoteError> {
    self.gate().await?;

    let k = key(scope, &record.id);
    let mut entry = self
      .records
      .get_mut(&k)
      .ok_or_else(|| RemoteError::NotFound(record.id.clone()))?;

    if entry.version != known_version {
      return Err(RemoteError::Conflict {
        identity: record.id.clone(),
        server_version: entry.version,
      });
    }

    let mut stored = record.clone();
    stored.version = Some(entry.version.unwrap_or(0) + 1);
    stored.updated_at = Utc::now();
    *entry = stored.clone();
    drop(entry);
    Ok(self.respond(stored))
  }

  async fn delete(&self, scope: &Scope, identity: &str) -> Result<(), RemoteError> {
    self.gate().await?;
    if self.ignore_deletes.load(Ordering::SeqCst) {
      return Ok(());
    }
    let k = key(scope, identity);
    match self.records.remove(&k) {
      Some(_) => {
        self.tokens.retain(|_, target| *target != k);
        Ok(())
      }
      None => Err(RemoteError::NotFound(identity.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::idempotency_token;
  use serde_json::json;

  fn shoe() -> Record {
    Record::from_json("p1", json!({"name": "Red Shoe", "qty": 5}))
  }

  #[tokio::test]
  async fn test_create_is_idempotent_per_token() {
    let store = MemoryRemoteStore::new();
    let scope = Scope::new("wh-1");
    let token = idempotency_token(&scope, "p1");

    store.create(&scope, &shoe(), &token).await.unwrap();
    store.create(&scope, &shoe(), &token).await.unwrap();

    assert_eq!(store.len(&scope), 1);
    assert_eq!(store.create_calls(), 2);
  }

  #[tokio::test]
  async fn test_stale_update_is_rejected() {
    let store = MemoryRemoteStore::new();
    let scope = Scope::new("wh-1");
    store.insert(&scope, shoe().with_version(2));

    let err = store.update(&scope, &shoe(), Some(1)).await.unwrap_err();
    assert_eq!(
      err,
      RemoteError::Conflict {
        identity: "p1".into(),
        server_version: Some(2)
      }
    );

    let ack = store.update(&scope, &shoe(), Some(2)).await.unwrap();
    match ack {
      WriteAck::Record(r) => assert_eq!(r.version, Some(3)),
      WriteAck::Acknowledged => panic!("expected full record"),
    }
  }

  #[tokio::test]
  async fn test_offline_store_refuses_everything() {
    let store = MemoryRemoteStore::new();
    let scope = Scope::new("wh-1");
    store.set_online(false);

    let err = store.list(&scope, 10).await.unwrap_err();
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_delete_releases_token() {
    let store = MemoryRemoteStore::new();
    let scope = Scope::new("wh-1");
    let token = idempotency_token(&scope, "p1");
    store.create(&scope, &shoe(), &token).await.unwrap();

    store.delete(&scope, "p1").await.unwrap();
    assert!(store.is_empty(&scope));

    store.create(&scope, &shoe(), &token).await.unwrap();
    assert_eq!(store.len(&scope), 1);
  }

  #[tokio::test]
  async fn test_ack_only_still_applies_write() {
    let store = MemoryRemoteStore::new();
    let scope = Scope::new("wh-1");
    store.set_ack_only(true);

    let ack = store
      .create(&scope, &shoe(), &idempotency_token(&scope, "p1"))
      .await
      .unwrap();
    assert_eq!(ack, WriteAck::Acknowledged);
    assert!(store.record(&scope, "p1").is_some());
  }
}
