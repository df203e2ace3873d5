//! The sync core: records and their states, the write pipeline behind
//! [`SyncEngine`], the local-only tracker, conflict resolution, read
//! reconciliation, the undo window and the resync scheduler.

mod conflict;
mod engine;
mod pipeline;
mod reconcile;
mod record;
mod scheduler;
mod state;
mod tracker;
mod undo;

pub use conflict::{
  detect, AuditEntry, ConflictCase, ConflictKind, ConflictResolver, LocalSide, Resolution,
  ResolutionChoice, ResolvedRecord, AUDIT_LOG_KEY,
};
pub use engine::{
  BulkDeleteReport, EngineSettings, RefreshOptions, RefreshReport, SyncEngine, SyncHistoryEntry,
  SYNC_HISTORY_KEY,
};
pub use pipeline::{OptimisticTicket, ServerClock, Snapshot, WriteOutcome, WriteSequencer};
pub use reconcile::{is_suspicious_empty, merge, overlay};
pub use record::{idempotency_token, Record, Scope, LEGACY_CACHE_KEY};
pub use scheduler::{ResyncScheduler, Trigger};
pub use state::{IllegalTransition, SavePhase, SyncState, SyncStates, VerifiedRecord};
pub use tracker::{push_bounded, LocalOnlyTracker, PushReport, LOCAL_ONLY_KEY};
pub use undo::{UndoBuffer, UndoEntry};
