//! Per-record sync state and its legal transitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::record::Record;

/// Client-local sync status of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  /// Confirmed present on the server by a verification read.
  Synced,
  /// Applied locally; the remote write never reached the server.
  LocalOnly,
  /// Optimistically applied, remote write in flight.
  Saving,
  /// Remote acknowledged the write, confirmation read outstanding or failed.
  Verifying,
  /// Remote rejected the write because its version moved on.
  Conflict,
  /// Retries or verification exhausted without a confirmed result.
  Error,
}

impl SyncState {
  /// Whether `self -> next` is a legal edge. Edges into `Synced` also require
  /// a [`VerifiedRecord`], enforced by [`SyncStates::promote`].
  pub fn can_transition_to(self, next: SyncState) -> bool {
    use SyncState::*;
    matches!(
      (self, next),
      (Synced, Saving)
        | (Synced, Synced)
        | (Saving, Saving | Synced | Verifying | LocalOnly | Conflict | Error)
        | (Verifying, Saving | Synced | Error)
        | (LocalOnly, Saving)
        | (Conflict, Saving | Synced)
        | (Error, Saving | Verifying)
    )
  }
}

/// Write pipeline phase, exposed to the UI as `save_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePhase {
  #[default]
  Idle,
  ApplyingOptimistic,
  Submitting,
  Verifying,
  Committed,
  /// Kept on this device; the remote store was unreachable.
  SavedLocally,
  RolledBack,
  Error,
}

/// A record whose payload came straight from the server, either as a full
/// authoritative write response or as the result of a verification read.
///
/// Only code inside the crate can mint one, which is what keeps `Synced`
/// honest.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedRecord(Record);

impl VerifiedRecord {
  pub(crate) fn from_server(record: Record) -> Self {
    Self(record)
  }

  pub fn record(&self) -> &Record {
    &self.0
  }

  pub fn into_record(self) -> Record {
    self.0
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal sync state transition for '{identity}': {from:?} -> {to:?}")]
pub struct IllegalTransition {
  pub identity: String,
  pub from: Option<SyncState>,
  pub to: SyncState,
}

/// Sync state table for every record the engine knows about.
#[derive(Debug, Default, Clone)]
pub struct SyncStates {
  states: HashMap<String, SyncState>,
}

impl SyncStates {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, identity: &str) -> Option<SyncState> {
    self.states.get(identity).copied()
  }

  /// Start a write: any known state (or none) may enter `Saving` as long as
  /// the edge is legal.
  pub fn begin_save(&mut self, identity: &str) -> Result<Option<SyncState>, IllegalTransition> {
    let previous = self.get(identity);
    if let Some(from) = previous {
      if !from.can_transition_to(SyncState::Saving) {
        return Err(self.illegal(identity, previous, SyncState::Saving));
      }
    }
    self.states.insert(identity.to_string(), SyncState::Saving);
    Ok(previous)
  }

  /// Move along a legal edge. `Synced` is never reachable through here.
  pub fn transition(&mut self, identity: &str, next: SyncState) -> Result<(), IllegalTransition> {
    let from = self.get(identity);
    let legal = next != SyncState::Synced && from.is_some_and(|f| f.can_transition_to(next));
    if !legal {
      return Err(self.illegal(identity, from, next));
    }
    self.states.insert(identity.to_string(), next);
    Ok(())
  }

  /// Promote to `Synced` on the strength of a server-confirmed payload.
  pub fn promote(&mut self, verified: &VerifiedRecord) -> Result<(), IllegalTransition> {
    let identity = &verified.record().id;
    let from = self.get(identity);
    if let Some(f) = from {
      if !f.can_transition_to(SyncState::Synced) {
        return Err(self.illegal(identity, from, SyncState::Synced));
      }
    }
    self.states.insert(identity.clone(), SyncState::Synced);
    Ok(())
  }

  /// Replace whatever the client held with the server's copy. Legal from any
  /// state except while a write for the identity is still in flight.
  pub fn adopt(&mut self, verified: &VerifiedRecord) -> Result<(), IllegalTransition> {
    let identity = &verified.record().id;
    let from = self.get(identity);
    if matches!(from, Some(SyncState::Saving | SyncState::Verifying)) {
      return Err(self.illegal(identity, from, SyncState::Synced));
    }
    self.states.insert(identity.clone(), SyncState::Synced);
    Ok(())
  }

  /// Re-enter `LocalOnly` for an identity restored from the durable
  /// local-only set. Known identities keep their state.
  pub fn restore_local_only(&mut self, identity: &str) {
    self
      .states
      .entry(identity.to_string())
      .or_insert(SyncState::LocalOnly);
  }

  /// Undo a `Saving` entry after a rollback, restoring what it superseded.
  pub fn restore(
    &mut self,
    identity: &str,
    previous: Option<SyncState>,
  ) -> Result<(), IllegalTransition> {
    let from = self.get(identity);
    if from != Some(SyncState::Saving) {
      return Err(self.illegal(identity, from, previous.unwrap_or(SyncState::Saving)));
    }
    match previous {
      Some(state) => self.states.insert(identity.to_string(), state),
      None => self.states.remove(identity),
    };
    Ok(())
  }

  pub fn forget(&mut self, identity: &str) {
    self.states.remove(identity);
  }

  pub fn count(&self, state: SyncState) -> usize {
    self.states.values().filter(|s| **s == state).count()
  }

  fn illegal(&self, identity: &str, from: Option<SyncState>, to: SyncState) -> IllegalTransition {
    IllegalTransition {
      identity: identity.to_string(),
      from,
      to,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn verified(id: &str) -> VerifiedRecord {
    VerifiedRecord::from_server(Record::from_json(id, json!({"qty": 1})).with_version(1))
  }

  #[test]
  fn test_happy_path_through_verification() {
    let mut states = SyncStates::new();
    assert_eq!(states.begin_save("p1").unwrap(), None);
    states.transition("p1", SyncState::Verifying).unwrap();
    states.promote(&verified("p1")).unwrap();
    assert_eq!(states.get("p1"), Some(SyncState::Synced));
  }

  #[test]
  fn test_synced_is_unreachable_without_verification() {
    let mut states = SyncStates::new();
    states.begin_save("p1").unwrap();
    states.transition("p1", SyncState::Verifying).unwrap();

    let err = states.transition("p1", SyncState::Synced).unwrap_err();
    assert_eq!(err.from, Some(SyncState::Verifying));
    assert_eq!(states.get("p1"), Some(SyncState::Verifying));
  }

  #[test]
  fn test_local_only_must_pass_through_saving() {
    let mut states = SyncStates::new();
    states.begin_save("p1").unwrap();
    states.transition("p1", SyncState::LocalOnly).unwrap();

    assert!(states.promote(&verified("p1")).is_err());
    states.begin_save("p1").unwrap();
    states.promote(&verified("p1")).unwrap();
    assert_eq!(states.get("p1"), Some(SyncState::Synced));
  }

  #[test]
  fn test_overlapping_saves_chain_previous_states() {
    let mut states = SyncStates::new();
    states.promote(&verified("p1")).unwrap();
    assert_eq!(states.begin_save("p1").unwrap(), Some(SyncState::Synced));
    assert_eq!(states.begin_save("p1").unwrap(), Some(SyncState::Saving));
  }

  #[test]
  fn test_adopt_refuses_in_flight_writes() {
    let mut states = SyncStates::new();
    states.restore_local_only("p1");
    assert_eq!(states.get("p1"), Some(SyncState::LocalOnly));
    states.adopt(&verified("p1")).unwrap();
    assert_eq!(states.get("p1"), Some(SyncState::Synced));

    states.begin_save("p1").unwrap();
    assert!(states.adopt(&verified("p1")).is_err());
  }

  #[test]
  fn test_restore_only_from_saving() {
    let mut states = SyncStates::new();
    states.promote(&verified("p1")).unwrap();
    let previous = states.begin_save("p1").unwrap();
    states.restore("p1", previous).unwrap();
    assert_eq!(states.get("p1"), Some(SyncState::Synced));

    assert!(states.restore("p1", None).is_err());
  }

  #[test]
  fn test_transition_table() {
    use SyncState::*;
    assert!(Conflict.can_transition_to(Saving));
    assert!(Error.can_transition_to(Verifying));
    assert!(!Verifying.can_transition_to(LocalOnly));
    assert!(!LocalOnly.can_transition_to(Synced));
    assert!(!Error.can_transition_to(Synced));
  }
}
