//! Undo window for recent creates.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::record::Scope;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
  pub scope: Scope,
  pub identity: String,
  pub created_at: Instant,
}

/// The most recent creates, each undoable for a fixed window.
#[derive(Debug)]
pub struct UndoBuffer {
  entries: VecDeque<UndoEntry>,
  window: Duration,
  capacity: usize,
}

impl UndoBuffer {
  pub fn new(window: Duration, capacity: usize) -> Self {
    Self {
      entries: VecDeque::new(),
      window,
      capacity: capacity.max(1),
    }
  }

  /// Remember a create. The oldest entry falls out past capacity.
  pub fn push(&mut self, scope: &Scope, identity: &str) {
    self.entries.retain(|e| !(e.scope == *scope && e.identity == identity));
    self.entries.push_back(UndoEntry {
      scope: scope.clone(),
      identity: identity.to_string(),
      created_at: Instant::now(),
    });
    while self.entries.len() > self.capacity {
      self.entries.pop_front();
    }
  }

  /// Drop expired entries. Returns what was removed.
  pub fn sweep(&mut self) -> Vec<UndoEntry> {
    let now = Instant::now();
    let window = self.window;
    let mut expired = Vec::new();
    self.entries.retain(|e| {
      let alive = now.duration_since(e.created_at) <= window;
      if !alive {
        expired.push(e.clone());
      }
      alive
    });
    if !expired.is_empty() {
      debug!(count = expired.len(), "undo entries expired");
    }
    expired
  }

  /// Claim the entry for `identity` if its window is still open.
  pub fn take(&mut self, scope: &Scope, identity: &str) -> Result<UndoEntry, SyncError> {
    self.sweep();
    let index = self
      .entries
      .iter()
      .position(|e| e.scope == *scope && e.identity == identity)
      .ok_or_else(|| SyncError::UndoExpired(identity.to_string()))?;
    self
      .entries
      .remove(index)
      .ok_or_else(|| SyncError::UndoExpired(identity.to_string()))
  }

  /// Put a claimed entry back, e.g. after the undo itself failed.
  pub fn reinstate(&mut self, entry: UndoEntry) {
    self.entries.push_back(entry);
  }

  pub fn forget(&mut self, scope: &Scope, identity: &str) {
    self
      .entries
      .retain(|e| !(e.scope == *scope && e.identity == identity));
  }

  pub fn pending(&self) -> Vec<String> {
    self.entries.iter().map(|e| e.identity.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn buffer() -> UndoBuffer {
    UndoBuffer::new(Duration::from_secs(10), 5)
  }

  #[tokio::test(start_paused = true)]
  async fn test_take_within_window() {
    let mut undo = buffer();
    let scope = Scope::new("wh-1");
    undo.push(&scope, "p1");

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(undo.take(&scope, "p1").unwrap().identity, "p1");
    assert!(undo.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entries_are_swept() {
    let mut undo = buffer();
    let scope = Scope::new("wh-1");
    undo.push(&scope, "p1");

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(undo.sweep().len(), 1);
    assert_eq!(
      undo.take(&scope, "p1"),
      Err(SyncError::UndoExpired("p1".into()))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_capacity_keeps_most_recent() {
    let mut undo = buffer();
    let scope = Scope::new("wh-1");
    for i in 0..7 {
      undo.push(&scope, &format!("p{}", i));
    }
    assert_eq!(undo.len(), 5);
    assert_eq!(undo.pending().first().map(String::as_str), Some("p2"));
    assert!(undo.take(&scope, "p0").is_err());
  }
}
