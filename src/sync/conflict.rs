//! Conflict detection, the explicit resolution protocol and its audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::record::{Record, Scope};
use crate::cache::DurableCache;
use crate::error::SyncError;

/// Durable key of the append-only audit log. Not clearable.
pub const AUDIT_LOG_KEY: &str = "conflict_audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
  /// Both sides exist and differ, and the local edit was made against a
  /// version the server has since moved past.
  ConcurrentEdit,
  /// The server copy is gone while the local copy was never confirmed
  /// deleted.
  ServerDeleted,
  /// A delete was requested locally but the record reappeared on the server.
  LocalDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
  KeepLocal,
  KeepServer,
  LastWriteWins,
  Merge,
}

impl fmt::Display for ResolutionChoice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResolutionChoice::KeepLocal => "keep_local",
      ResolutionChoice::KeepServer => "keep_server",
      ResolutionChoice::LastWriteWins => "last_write_wins",
      ResolutionChoice::Merge => "merge",
    };
    f.write_str(name)
  }
}

/// What the client holds for the identity in question.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalSide {
  /// An edit (or create) not yet accepted by the server.
  Edited(Record),
  /// The last local copy of a record the user asked to delete.
  Deleted(Record),
}

impl LocalSide {
  pub fn record(&self) -> &Record {
    match self {
      LocalSide::Edited(r) | LocalSide::Deleted(r) => r,
    }
  }
}

/// Classify the disagreement between the local side and the server copy.
/// `None` means there is nothing to resolve.
pub fn detect(local: &LocalSide, server: Option<&Record>) -> Option<ConflictKind> {
  match (local, server) {
    (LocalSide::Edited(local), Some(server)) => {
      if local.same_payload(server) || local.version == server.version {
        None
      } else {
        Some(ConflictKind::ConcurrentEdit)
      }
    }
    (LocalSide::Edited(_), None) => Some(ConflictKind::ServerDeleted),
    (LocalSide::Deleted(_), Some(_)) => Some(ConflictKind::LocalDeleted),
    (LocalSide::Deleted(_), None) => None,
  }
}

/// A detected disagreement awaiting a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCase {
  pub id: u64,
  pub scope: Scope,
  pub identity: String,
  pub kind: ConflictKind,
  pub local: Record,
  pub server: Option<Record>,
  pub local_version: Option<u64>,
  pub server_version: Option<u64>,
  pub detected_at: DateTime<Utc>,
}

/// What the engine has to do to apply a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// Update the server with `record`, editing against `known_version`.
  Submit {
    record: Record,
    known_version: Option<u64>,
  },
  /// The server copy is gone; create it again.
  Recreate(Record),
  /// Take the server copy as it is.
  Adopt(Record),
  /// Drop the local copy.
  DropLocal,
  /// Delete the record on the server.
  Delete,
}

impl Resolution {
  fn summary(&self) -> String {
    match self {
      Resolution::Submit { record, .. } => format!("submit {}", record.summary()),
      Resolution::Recreate(record) => format!("recreate {}", record.summary()),
      Resolution::Adopt(record) => format!("adopt {}", record.summary()),
      Resolution::DropLocal => "drop local copy".to_string(),
      Resolution::Delete => "delete on server".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
  pub identity: String,
  pub scope: Scope,
  pub case_id: u64,
  pub kind: ConflictKind,
  pub choice: ResolutionChoice,
  pub at: DateTime<Utc>,
  pub resulting_payload_summary: String,
}

/// A resolved case and the action it calls for.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
  pub case: ConflictCase,
  pub choice: ResolutionChoice,
  pub resolution: Resolution,
  pub audit: AuditEntry,
}

/// Owns the lifecycle of conflict cases: open, resolve exactly once, log.
pub struct ConflictResolver {
  pending: BTreeMap<u64, ConflictCase>,
  resolved: HashSet<u64>,
  next_id: u64,
  audit: Vec<AuditEntry>,
  cache: Arc<DurableCache>,
}

impl ConflictResolver {
  /// Restore the audit log from the durable cache.
  pub fn load(cache: Arc<DurableCache>) -> Self {
    let audit: Vec<AuditEntry> = cache
      .read_blob(AUDIT_LOG_KEY)
      .and_then(|data| match serde_json::from_slice(&data) {
        Ok(entries) => Some(entries),
        Err(e) => {
          warn!(error = %e, "discarding malformed conflict audit log");
          None
        }
      })
      .unwrap_or_default();
    let next_id = audit.iter().map(|e| e.case_id).max().unwrap_or(0);
    Self {
      pending: BTreeMap::new(),
      resolved: HashSet::new(),
      next_id,
      audit,
      cache,
    }
  }

  /// Detect and, if there is a disagreement, register a case. An older
  /// pending case for the same identity is replaced.
  pub fn open(&mut self, scope: &Scope, local: LocalSide, server: Option<Record>) -> Option<ConflictCase> {
    let kind = detect(&local, server.as_ref())?;
    let local = match local {
      LocalSide::Edited(r) | LocalSide::Deleted(r) => r,
    };

    self
      .pending
      .retain(|_, c| !(c.scope == *scope && c.identity == local.id));

    self.next_id += 1;
    let case = ConflictCase {
      id: self.next_id,
      scope: scope.clone(),
      identity: local.id.clone(),
      kind,
      local_version: local.version,
      server_version: server.as_ref().and_then(|s| s.version),
      local,
      server,
      detected_at: Utc::now(),
    };
    info!(case = case.id, identity = %case.identity, kind = ?case.kind, "conflict detected");
    self.pending.insert(case.id, case.clone());
    Some(case)
  }

  pub fn pending(&self) -> Vec<ConflictCase> {
    self.pending.values().cloned().collect()
  }

  pub fn pending_for(&self, scope: &Scope, identity: &str) -> Option<&ConflictCase> {
    self
      .pending
      .values()
      .find(|c| c.scope == *scope && c.identity == identity)
  }

  /// Put a case back up for decision under a new id after its resolution
  /// could not be applied. Does nothing when a newer case for the same
  /// identity is already pending.
  pub fn reopen(&mut self, case: ConflictCase) -> Option<ConflictCase> {
    if self.pending_for(&case.scope, &case.identity).is_some() {
      return None;
    }
    self.next_id += 1;
    let case = ConflictCase {
      id: self.next_id,
      ..case
    };
    info!(case = case.id, identity = %case.identity, kind = ?case.kind, "conflict reopened");
    self.pending.insert(case.id, case.clone());
    Some(case)
  }

  pub fn audit_log(&self) -> &[AuditEntry] {
    &self.audit
  }

  /// Resolve a pending case. The audit entry is appended and persisted
  /// before the resolution is handed back for applying.
  pub fn resolve(
    &mut self,
    case_id: u64,
    choice: ResolutionChoice,
    merged: Option<Record>,
  ) -> Result<ResolvedRecord, SyncError> {
    if self.resolved.contains(&case_id) {
      return Err(SyncError::AlreadyResolved(case_id));
    }
    let case = self
      .pending
      .get(&case_id)
      .ok_or_else(|| SyncError::NotFound(format!("conflict #{}", case_id)))?;

    let resolution = plan(case, choice, merged)?;
    let audit = AuditEntry {
      identity: case.identity.clone(),
      scope: case.scope.clone(),
      case_id,
      kind: case.kind,
      choice,
      at: Utc::now(),
      resulting_payload_summary: resolution.summary(),
    };
    self.audit.push(audit.clone());
    self.persist();

    let case = match self.pending.remove(&case_id) {
      Some(case) => case,
      None => return Err(SyncError::NotFound(format!("conflict #{}", case_id))),
    };
    self.resolved.insert(case_id);
    info!(case = case_id, identity = %case.identity, %choice, "conflict resolved");

    Ok(ResolvedRecord {
      case,
      choice,
      resolution,
      audit,
    })
  }

  fn persist(&self) {
    match serde_json::to_vec(&self.audit) {
      Ok(data) => {
        if !self.cache.write_blob(AUDIT_LOG_KEY, &data).ok {
          warn!("conflict audit log is held in memory only");
        }
      }
      Err(e) => warn!(error = %e, "failed to serialise conflict audit log"),
    }
  }
}

/// Turn a choice into the concrete action for the case's kind.
fn plan(case: &ConflictCase, choice: ResolutionChoice, merged: Option<Record>) -> Result<Resolution, SyncError> {
  let server = case.server.clone();
  let merged = match (choice, merged) {
    (ResolutionChoice::Merge, None) => {
      return Err(SyncError::Validation(
        "a merge resolution needs an explicit merged payload".into(),
      ))
    }
    (ResolutionChoice::Merge, Some(m)) if m.id != case.identity => {
      return Err(SyncError::Validation(format!(
        "merged payload is for '{}', not '{}'",
        m.id, case.identity
      )))
    }
    (ResolutionChoice::Merge, Some(m)) => {
      m.validate()?;
      Some(m)
    }
    (_, _) => None,
  };

  // Ties go to the server copy.
  let local_is_newer = |server: &Record| case.local.updated_at > server.updated_at;

  let resolution = match (case.kind, choice, server) {
    (ConflictKind::ConcurrentEdit, ResolutionChoice::KeepLocal, Some(server)) => Resolution::Submit {
      record: case.local.clone(),
      known_version: server.version,
    },
    (ConflictKind::ConcurrentEdit, ResolutionChoice::KeepServer, Some(server)) => {
      Resolution::Adopt(server)
    }
    (ConflictKind::ConcurrentEdit, ResolutionChoice::LastWriteWins, Some(server)) => {
      if local_is_newer(&server) {
        Resolution::Submit {
          record: case.local.clone(),
          known_version: server.version,
        }
      } else {
        Resolution::Adopt(server)
      }
    }
    (ConflictKind::ConcurrentEdit, ResolutionChoice::Merge, Some(server)) => Resolution::Submit {
      record: merged.unwrap_or_else(|| case.local.clone()),
      known_version: server.version,
    },

    (ConflictKind::ServerDeleted, ResolutionChoice::KeepLocal, _) => {
      Resolution::Recreate(case.local.clone())
    }
    (ConflictKind::ServerDeleted, ResolutionChoice::Merge, _) => {
      Resolution::Recreate(merged.unwrap_or_else(|| case.local.clone()))
    }
    // The deletion is the only server-side event with a timestamp we trust.
    (ConflictKind::ServerDeleted, _, _) => Resolution::DropLocal,

    (ConflictKind::LocalDeleted, ResolutionChoice::KeepLocal, _) => Resolution::Delete,
    (ConflictKind::LocalDeleted, ResolutionChoice::KeepServer, Some(server)) => {
      Resolution::Adopt(server)
    }
    (ConflictKind::LocalDeleted, ResolutionChoice::LastWriteWins, Some(server)) => {
      if local_is_newer(&server) {
        Resolution::Delete
      } else {
        Resolution::Adopt(server)
      }
    }
    (ConflictKind::LocalDeleted, ResolutionChoice::Merge, Some(server)) => Resolution::Submit {
      record: merged.unwrap_or_else(|| server.clone()),
      known_version: server.version,
    },

    // Concurrent edits and reappearances always carry a server copy.
    (kind, choice, None) => {
      return Err(SyncError::Validation(format!(
        "cannot apply {} to a {:?} case without a server copy",
        choice, kind
      )))
    }
  };
  Ok(resolution)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn resolver() -> ConflictResolver {
    ConflictResolver::load(Arc::new(DurableCache::in_memory()))
  }

  fn p2(price: i64, version: u64) -> Record {
    Record::from_json("p2", json!({ "price": price })).with_version(version)
  }

  #[test]
  fn test_detect_classifies_cases() {
    let local = p2(15, 1);
    assert_eq!(detect(&LocalSide::Edited(local.clone()), Some(&p2(15, 2))), None);
    assert_eq!(
      detect(&LocalSide::Edited(local.clone()), Some(&p2(12, 2))),
      Some(ConflictKind::ConcurrentEdit)
    );
    assert_eq!(
      detect(&LocalSide::Edited(local.clone()), None),
      Some(ConflictKind::ServerDeleted)
    );
    assert_eq!(
      detect(&LocalSide::Deleted(local.clone()), Some(&p2(12, 2))),
      Some(ConflictKind::LocalDeleted)
    );
    assert_eq!(detect(&LocalSide::Deleted(local), None), None);
  }

  #[test]
  fn test_unsynced_edit_against_current_version_is_not_a_conflict() {
    assert_eq!(detect(&LocalSide::Edited(p2(15, 2)), Some(&p2(12, 2))), None);
  }

  #[test]
  fn test_keep_server_adopts_and_audits() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let server = p2(12, 2);
    let case = resolver
      .open(&scope, LocalSide::Edited(p2(15, 1)), Some(server.clone()))
      .unwrap();
    assert_eq!(case.local_version, Some(1));
    assert_eq!(case.server_version, Some(2));

    let resolved = resolver.resolve(case.id, ResolutionChoice::KeepServer, None).unwrap();
    assert_eq!(resolved.resolution, Resolution::Adopt(server));
    assert_eq!(resolver.audit_log().len(), 1);
    assert_eq!(resolver.audit_log()[0].choice, ResolutionChoice::KeepServer);
    assert_eq!(resolver.audit_log()[0].identity, "p2");
    assert!(resolver.pending().is_empty());
  }

  #[test]
  fn test_case_resolves_exactly_once() {
    let mut resolver = resolver();
    let case = resolver
      .open(&Scope::new("wh-1"), LocalSide::Edited(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();
    resolver.resolve(case.id, ResolutionChoice::KeepLocal, None).unwrap();

    assert_eq!(
      resolver.resolve(case.id, ResolutionChoice::KeepServer, None),
      Err(SyncError::AlreadyResolved(case.id))
    );
    assert_eq!(resolver.audit_log().len(), 1);
  }

  #[test]
  fn test_merge_requires_payload_and_keeps_case_open() {
    let mut resolver = resolver();
    let case = resolver
      .open(&Scope::new("wh-1"), LocalSide::Edited(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();

    assert!(matches!(
      resolver.resolve(case.id, ResolutionChoice::Merge, None),
      Err(SyncError::Validation(_))
    ));
    assert!(resolver.audit_log().is_empty());

    let merged = p2(13, 1);
    let resolved = resolver
      .resolve(case.id, ResolutionChoice::Merge, Some(merged.clone()))
      .unwrap();
    assert_eq!(
      resolved.resolution,
      Resolution::Submit {
        record: merged,
        known_version: Some(2)
      }
    );
  }

  #[test]
  fn test_last_write_wins_compares_timestamps() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let server = p2(12, 2);
    let mut local = p2(15, 1);

    local.updated_at = server.updated_at + Duration::seconds(5);
    let case = resolver
      .open(&scope, LocalSide::Edited(local.clone()), Some(server.clone()))
      .unwrap();
    let resolved = resolver.resolve(case.id, ResolutionChoice::LastWriteWins, None).unwrap();
    assert!(matches!(resolved.resolution, Resolution::Submit { .. }));

    local.updated_at = server.updated_at;
    let case = resolver
      .open(&scope, LocalSide::Edited(local), Some(server.clone()))
      .unwrap();
    let resolved = resolver.resolve(case.id, ResolutionChoice::LastWriteWins, None).unwrap();
    assert_eq!(resolved.resolution, Resolution::Adopt(server));
  }

  #[test]
  fn test_server_deleted_choices() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let local = p2(15, 1);
    let case = resolver.open(&scope, LocalSide::Edited(local.clone()), None).unwrap();
    assert_eq!(case.kind, ConflictKind::ServerDeleted);
    let resolved = resolver.resolve(case.id, ResolutionChoice::KeepLocal, None).unwrap();
    assert_eq!(resolved.resolution, Resolution::Recreate(local.clone()));

    let case = resolver.open(&scope, LocalSide::Edited(local), None).unwrap();
    let resolved = resolver.resolve(case.id, ResolutionChoice::KeepServer, None).unwrap();
    assert_eq!(resolved.resolution, Resolution::DropLocal);
  }

  #[test]
  fn test_new_case_replaces_pending_one() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let first = resolver
      .open(&scope, LocalSide::Edited(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();
    let second = resolver
      .open(&scope, LocalSide::Edited(p2(16, 1)), Some(p2(12, 2)))
      .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(resolver.pending().len(), 1);
    assert!(matches!(
      resolver.resolve(first.id, ResolutionChoice::KeepServer, None),
      Err(SyncError::NotFound(_))
    ));
  }

  #[test]
  fn test_reopen_after_failed_apply() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let case = resolver
      .open(&scope, LocalSide::Edited(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();
    let resolved = resolver.resolve(case.id, ResolutionChoice::KeepLocal, None).unwrap();
    assert!(resolver.pending().is_empty());

    let reopened = resolver.reopen(resolved.case).unwrap();
    assert_ne!(reopened.id, case.id);
    assert_eq!(reopened.kind, case.kind);
    assert_eq!(reopened.local, case.local);
    assert_eq!(reopened.server, case.server);
    assert_eq!(resolver.pending(), vec![reopened.clone()]);
    assert_eq!(
      resolver.resolve(case.id, ResolutionChoice::KeepLocal, None),
      Err(SyncError::AlreadyResolved(case.id))
    );
    assert!(resolver.resolve(reopened.id, ResolutionChoice::KeepServer, None).is_ok());
    assert_eq!(resolver.audit_log().len(), 2);
  }

  #[test]
  fn test_reopen_skipped_when_newer_case_pending() {
    let mut resolver = resolver();
    let scope = Scope::new("wh-1");
    let case = resolver
      .open(&scope, LocalSide::Edited(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();
    let resolved = resolver.resolve(case.id, ResolutionChoice::KeepLocal, None).unwrap();
    let newer = resolver
      .open(&scope, LocalSide::Edited(p2(15, 1)), Some(p2(13, 3)))
      .unwrap();

    assert_eq!(resolver.reopen(resolved.case), None);
    assert_eq!(resolver.pending(), vec![newer]);
  }

  #[test]
  fn test_audit_log_survives_reload() {
    let cache = Arc::new(DurableCache::in_memory());
    let mut resolver = ConflictResolver::load(cache.clone());
    let case = resolver
      .open(&Scope::new("wh-1"), LocalSide::Deleted(p2(15, 1)), Some(p2(12, 2)))
      .unwrap();
    resolver.resolve(case.id, ResolutionChoice::KeepLocal, None).unwrap();

    let reloaded = ConflictResolver::load(cache);
    assert_eq!(reloaded.audit_log().len(), 1);
    assert_eq!(reloaded.audit_log()[0].kind, ConflictKind::LocalDeleted);
  }
}
