//! Building blocks of the write pipeline: optimistic tickets, per-identity
//! write ordering, the tagged write result and the server clock.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::conflict::ConflictCase;
use super::record::{Record, Scope};
use super::state::SyncState;
use crate::error::SyncError;

/// Result of a create or update. Callers branch on the variant instead of
/// inspecting error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Verified on the server; the record is `Synced`.
  SavedRemote(Record),
  /// The server acknowledged the write but the confirmation read failed or
  /// disagreed. Never report this as saved.
  SavedUnverified { record: Record, reason: String },
  /// The remote store was unreachable; the record lives on this device only
  /// and will be pushed later.
  SavedLocalOnly { record: Record, reason: String },
  /// The server's version moved on; a human decision is required.
  Conflict(ConflictCase),
  /// Nothing changed locally.
  Failed(SyncError),
}

impl WriteOutcome {
  pub fn kind(&self) -> &'static str {
    match self {
      WriteOutcome::SavedRemote(_) => "saved_remote",
      WriteOutcome::SavedUnverified { .. } => "saved_unverified",
      WriteOutcome::SavedLocalOnly { .. } => "saved_local_only",
      WriteOutcome::Conflict(_) => "conflict",
      WriteOutcome::Failed(_) => "failed",
    }
  }

  pub fn is_saved_remote(&self) -> bool {
    matches!(self, WriteOutcome::SavedRemote(_))
  }

  /// The record as it now stands locally, if the write left one.
  pub fn record(&self) -> Option<&Record> {
    match self {
      WriteOutcome::SavedRemote(record)
      | WriteOutcome::SavedUnverified { record, .. }
      | WriteOutcome::SavedLocalOnly { record, .. } => Some(record),
      WriteOutcome::Conflict(_) | WriteOutcome::Failed(_) => None,
    }
  }

  /// The error view of the outcome, for callers that only care whether the
  /// server confirmed the write.
  pub fn into_result(self) -> Result<Record, SyncError> {
    match self {
      WriteOutcome::SavedRemote(record) => Ok(record),
      WriteOutcome::SavedUnverified { record, reason } => Err(SyncError::VerificationFailure {
        identity: record.id,
        reason,
      }),
      WriteOutcome::SavedLocalOnly { record, reason } => Err(SyncError::Network(format!(
        "'{}' saved on this device only: {}",
        record.id, reason
      ))),
      WriteOutcome::Conflict(case) => Err(SyncError::Conflict {
        identity: case.identity,
      }),
      WriteOutcome::Failed(err) => Err(err),
    }
  }
}

/// The value and state a write built on.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub record: Option<Record>,
  pub state: Option<SyncState>,
}

/// Handle for one optimistic apply, carried to its resolution.
#[derive(Debug, Clone)]
pub struct OptimisticTicket {
  pub scope: Scope,
  pub identity: String,
  pub seq: u64,
  pub applied: Record,
}

impl OptimisticTicket {
  /// Whether the in-memory value is still the one this ticket applied.
  pub fn still_applied(&self, current: Option<&Record>) -> bool {
    current.is_some_and(|c| c.same_payload(&self.applied) && c.version == self.applied.version)
  }
}

#[derive(Debug)]
struct InFlight {
  seq: u64,
  base: Snapshot,
}

/// In-flight writes per identity, oldest first.
///
/// Only the newest write may touch the local value when it resolves. An
/// older write that resolves first hands its outcome to the write after it,
/// so a later rollback restores what is actually true rather than the value
/// of a write that already failed.
#[derive(Debug, Default)]
pub struct WriteSequencer {
  next: u64,
  in_flight: HashMap<String, Vec<InFlight>>,
}

impl WriteSequencer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start a write on top of `base`.
  pub fn issue(&mut self, identity: &str, base: Snapshot) -> u64 {
    self.next += 1;
    self
      .in_flight
      .entry(identity.to_string())
      .or_default()
      .push(InFlight {
        seq: self.next,
        base,
      });
    self.next
  }

  /// Whether `seq` is the newest write in flight for `identity`.
  pub fn is_current(&self, identity: &str, seq: u64) -> bool {
    self
      .in_flight
      .get(identity)
      .and_then(|stack| stack.last())
      .is_some_and(|w| w.seq == seq)
  }

  pub fn in_flight(&self, identity: &str) -> usize {
    self.in_flight.get(identity).map_or(0, Vec::len)
  }

  /// Retire write `seq`.
  ///
  /// If it was the newest write the snapshot it superseded is returned and
  /// the caller owns the local value. Otherwise the next write inherits
  /// `settled` (or, for a failed write, this write's own base) and `None` is
  /// returned: the resolution is stale and must not be applied.
  pub fn retire(&mut self, identity: &str, seq: u64, settled: Option<Snapshot>) -> Option<Snapshot> {
    let stack = self.in_flight.get_mut(identity)?;
    let pos = stack.iter().position(|w| w.seq == seq)?;
    let done = stack.remove(pos);
    let result = if pos < stack.len() {
      stack[pos].base = settled.unwrap_or(done.base);
      None
    } else {
      Some(done.base)
    };
    if stack.is_empty() {
      self.in_flight.remove(identity);
    }
    result
  }
}

/// Offset between the local clock and the server's, estimated from the
/// timestamps on authoritative responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerClock {
  offset: Duration,
  observed: bool,
}

impl ServerClock {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a server timestamp seen at local time `local_now`.
  pub fn observe(&mut self, server_time: DateTime<Utc>, local_now: DateTime<Utc>) {
    let sample = server_time - local_now;
    // First sample wins outright, later ones are smoothed.
    self.offset = if self.observed {
      (self.offset + sample) / 2
    } else {
      sample
    };
    self.observed = true;
  }

  pub fn offset(&self) -> Duration {
    self.offset
  }

  /// Current time on the server's clock.
  pub fn now(&self) -> DateTime<Utc> {
    Utc::now() + self.offset
  }
}
