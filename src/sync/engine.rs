//! The sync engine.
//!
//! One constructible object owns the cache references, the local-only set,
//! open conflicts and the undo window, and exposes the operations the UI
//! layer may call. All in-process state sits behind a single mutex that is
//! never held across an `.await`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::conflict::{AuditEntry, ConflictCase, ConflictResolver, LocalSide, Resolution, ResolutionChoice};
use super::pipeline::{OptimisticTicket, ServerClock, Snapshot, WriteOutcome, WriteSequencer};
use super::reconcile::{is_suspicious_empty, merge, overlay};
use super::record::{idempotency_token, Record, Scope};
use super::state::{IllegalTransition, SavePhase, SyncState, SyncStates, VerifiedRecord};
use super::tracker::{push_bounded, LocalOnlyTracker, PushReport};
use super::undo::UndoBuffer;
use crate::cache::{CacheResolver, CacheSource, DurableCache};
use crate::config::Config;
use crate::error::SyncError;
use crate::remote::{retry, RemoteError, RemoteStore, RetryConfig, WriteAck};

/// Derived, clearable key holding recent push summaries.
pub const SYNC_HISTORY_KEY: &str = "sync_history";
const SYNC_HISTORY_LIMIT: usize = 50;
const MAX_WARNINGS: usize = 20;

#[derive(Debug, Clone)]
pub struct EngineSettings {
  /// Page size for list-by-scope reads
  pub page_limit: usize,
  /// Maximum simultaneous pushes of local-only records
  pub push_concurrency: usize,
  /// Per remote call; elapsing counts as a network failure
  pub call_timeout: Duration,
  /// How long a cached scope is served without a remote call
  pub freshness: chrono::Duration,
  pub undo_window: Duration,
  pub undo_capacity: usize,
  pub read_retry: RetryConfig,
  pub push_retry: RetryConfig,
  /// Resolve version conflicts by timestamp without asking
  pub auto_last_write_wins: bool,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      page_limit: 500,
      push_concurrency: 5,
      call_timeout: Duration::from_secs(30),
      freshness: chrono::Duration::minutes(5),
      undo_window: Duration::from_secs(10),
      undo_capacity: 5,
      read_retry: RetryConfig::read(),
      push_retry: RetryConfig::push(),
      auto_last_write_wins: false,
    }
  }
}

impl EngineSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      page_limit: config.remote.page_limit,
      push_concurrency: config.sync.push_concurrency,
      call_timeout: Duration::from_secs(config.remote.timeout_secs),
      freshness: chrono::Duration::seconds(config.cache.freshness_secs as i64),
      undo_window: Duration::from_secs(config.sync.undo_window_secs),
      undo_capacity: config.sync.undo_capacity,
      read_retry: RetryConfig::read().with_max_attempts(config.sync.read_retries),
      push_retry: RetryConfig::push(),
      auto_last_write_wins: config.sync.auto_last_write_wins,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
  /// Keep showing current data; no loading indicator.
  pub silent: bool,
  /// Go to the server even when the cache is fresh.
  pub force: bool,
}

impl RefreshOptions {
  pub fn silent() -> Self {
    Self {
      silent: true,
      force: true,
    }
  }

  pub fn forced() -> Self {
    Self {
      silent: false,
      force: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
  pub source: CacheSource,
  pub count: usize,
  /// Non-fatal problem the UI should surface.
  pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkDeleteReport {
  pub deleted: Vec<String>,
  /// Still reported by the server; kept locally.
  pub unconfirmed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
  pub at: DateTime<Utc>,
  pub scope: Scope,
  #[serde(flatten)]
  pub report: PushReport,
}

/// Which version an update is edited against.
enum Against {
  /// The version of the local copy.
  Local,
  Version(Option<u64>),
}

struct EngineState {
  scope: Scope,
  products: Vec<Record>,
  states: HashMap<Scope, SyncStates>,
  sequencer: WriteSequencer,
  clock: ServerClock,
  phase: SavePhase,
  loading: bool,
  error: Option<SyncError>,
  warnings: Vec<String>,
  loaded: HashSet<Scope>,
  tracker: LocalOnlyTracker,
  conflicts: ConflictResolver,
  undo: UndoBuffer,
}

impl EngineState {
  fn states_mut(&mut self, scope: &Scope) -> &mut SyncStates {
    self.states.entry(scope.clone()).or_default()
  }

  fn state_of(&self, scope: &Scope, identity: &str) -> Option<SyncState> {
    self.states.get(scope).and_then(|s| s.get(identity))
  }

  fn warn(&mut self, message: String) {
    if self.warnings.contains(&message) {
      return;
    }
    self.warnings.push(message);
    if self.warnings.len() > MAX_WARNINGS {
      self.warnings.remove(0);
    }
  }

  fn seed_local_only(&mut self, scope: &Scope) {
    for identity in self.tracker.ids(scope) {
      self.states_mut(scope).restore_local_only(&identity);
    }
  }
}

fn upsert(records: &mut Vec<Record>, record: Record) {
  match records.iter().position(|r| r.id == record.id) {
    Some(i) => records[i] = record,
    None => records.push(record),
  }
}

fn note(result: Result<(), IllegalTransition>) {
  if let Err(err) = result {
    error!(%err, "illegal sync state transition");
  }
}

fn illegal(err: IllegalTransition) -> SyncError {
  error!(%err, "illegal sync state transition");
  SyncError::Validation(err.to_string())
}

/// Offline-first inventory sync engine over a [`RemoteStore`].
pub struct SyncEngine<R: RemoteStore> {
  remote: Arc<R>,
  cache: Arc<DurableCache>,
  resolver: CacheResolver,
  settings: EngineSettings,
  state: Mutex<EngineState>,
  generation: watch::Sender<u64>,
}

impl<R: RemoteStore> SyncEngine<R> {
  /// Build an engine for `scope`, showing whatever the cache already holds.
  pub fn new(remote: Arc<R>, cache: Arc<DurableCache>, scope: Scope, settings: EngineSettings) -> Self {
    let resolver = CacheResolver::new(cache.clone()).with_freshness(settings.freshness);
    let (generation, _) = watch::channel(0);

    let mut state = EngineState {
      products: resolver.resolve(&scope).records,
      scope: scope.clone(),
      states: HashMap::new(),
      sequencer: WriteSequencer::new(),
      clock: ServerClock::new(),
      phase: SavePhase::Idle,
      loading: false,
      error: None,
      warnings: Vec::new(),
      loaded: HashSet::new(),
      tracker: LocalOnlyTracker::load(cache.clone()),
      conflicts: ConflictResolver::load(cache.clone()),
      undo: UndoBuffer::new(settings.undo_window, settings.undo_capacity),
    };
    state.seed_local_only(&scope);

    Self {
      remote,
      cache,
      resolver,
      settings,
      state: Mutex::new(state),
      generation,
    }
  }

  fn lock(&self) -> MutexGuard<'_, EngineState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }

  pub fn cache(&self) -> &Arc<DurableCache> {
    &self.cache
  }

  pub fn scope(&self) -> Scope {
    self.lock().scope.clone()
  }

  /// Records of the current scope as the UI should show them.
  pub fn products(&self) -> Vec<Record> {
    self.lock().products.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.lock().loading
  }

  /// Last refresh error that left nothing to show.
  pub fn error(&self) -> Option<SyncError> {
    self.lock().error.clone()
  }

  pub fn save_phase(&self) -> SavePhase {
    self.lock().phase
  }

  /// Local-only records in the current scope.
  pub fn unsynced_count(&self) -> usize {
    let st = self.lock();
    st.tracker.count_in(&st.scope)
  }

  pub fn is_unsynced(&self, identity: &str) -> bool {
    let st = self.lock();
    st.tracker.contains(&st.scope, identity)
  }

  pub fn sync_state(&self, identity: &str) -> Option<SyncState> {
    let st = self.lock();
    st.state_of(&st.scope, identity)
  }

  /// Non-fatal warnings raised since the last clear.
  pub fn warnings(&self) -> Vec<String> {
    self.lock().warnings.clone()
  }

  pub fn clear_warnings(&self) {
    self.lock().warnings.clear();
  }

  /// Whether the latest critical cache write only reached memory.
  pub fn storage_persist_failed(&self) -> bool {
    self.cache.storage_persist_failed()
  }

  pub fn pending_conflicts(&self) -> Vec<ConflictCase> {
    self.lock().conflicts.pending()
  }

  pub fn audit_log(&self) -> Vec<AuditEntry> {
    self.lock().conflicts.audit_log().to_vec()
  }

  pub fn pending_undo(&self) -> Vec<String> {
    self.lock().undo.pending()
  }

  /// Drop undo entries whose window has closed.
  pub fn sweep_undo(&self) -> Vec<String> {
    self
      .lock()
      .undo
      .sweep()
      .into_iter()
      .map(|e| e.identity)
      .collect()
  }

  pub fn sync_history(&self) -> Vec<SyncHistoryEntry> {
    self
      .cache
      .read_blob(SYNC_HISTORY_KEY)
      .and_then(|data| serde_json::from_slice(&data).ok())
      .unwrap_or_default()
  }

  /// Switch to another scope. In-flight loads of the previous scope are
  /// cancelled and the best cached data for the new one is shown at once.
  pub fn switch_scope(&self, scope: Scope) {
    let mut guard = self.lock();
    let st = &mut *guard;
    if st.scope == scope {
      return;
    }
    self.generation.send_modify(|g| *g += 1);
    info!(from = %st.scope, to = %scope, "switching scope");

    st.products = self.resolver.resolve(&scope).records;
    st.scope = scope.clone();
    st.seed_local_only(&scope);
    st.loading = false;
    st.error = None;
    st.phase = SavePhase::Idle;
  }

  // ---------------------------------------------------------------------
  // Writes
  // ---------------------------------------------------------------------

  /// Create a record: optimistic apply, idempotent submit, verify, commit.
  pub async fn add_product(&self, record: Record) -> WriteOutcome {
    if let Err(e) = record.validate() {
      return WriteOutcome::Failed(e);
    }

    let prepared = {
      let mut guard = self.lock();
      let st = &mut *guard;
      let scope = st.scope.clone();
      if self.lookup(st, &scope, &record.id).is_some() {
        Err(SyncError::Validation(format!(
          "'{}' already exists in {}",
          record.id, scope
        )))
      } else {
        let mut applied = record;
        applied.version = None;
        applied.updated_at = st.clock.now();
        self.apply_optimistic(st, &scope, applied)
      }
    };
    let ticket = match prepared {
      Ok(ticket) => ticket,
      Err(e) => return WriteOutcome::Failed(e),
    };

    let outcome = self.submit_create(&ticket).await;
    if outcome.record().is_some() {
      self.lock().undo.push(&ticket.scope, &ticket.identity);
    }
    self.settle_phase(&outcome);
    outcome
  }

  /// Update a record, editing against the version of the local copy.
  pub async fn update_product(&self, record: Record) -> WriteOutcome {
    if let Err(e) = record.validate() {
      return WriteOutcome::Failed(e);
    }
    let scope = self.scope();
    let outcome = self.submit_update(&scope, record, Against::Local).await;
    self.settle_phase(&outcome);
    outcome
  }

  /// Delete a record. Local state only changes once a read of the scope
  /// confirms the server no longer has it.
  pub async fn delete_product(&self, identity: &str) -> Result<(), SyncError> {
    let scope = self.scope();
    self.delete_in(&scope, identity).await
  }

  /// Bulk delete with one verification read. Only confirmed-absent
  /// identities are removed locally.
  pub async fn delete_products(&self, identities: &[String]) -> Result<BulkDeleteReport, SyncError> {
    if identities.is_empty() {
      return Ok(BulkDeleteReport::default());
    }
    let scope = self.scope();

    match self.call(self.remote.delete_many(&scope, identities)).await {
      Ok(()) | Err(SyncError::NotFound(_)) => {}
      Err(e) => {
        warn!(%scope, count = identities.len(), error = %e, "bulk delete failed");
        return Err(e);
      }
    }

    let present = match self.still_present(&scope, identities).await {
      Ok(present) => present,
      Err(e) => {
        warn!(%scope, error = %e, "could not confirm bulk delete");
        return Ok(BulkDeleteReport {
          deleted: Vec::new(),
          unconfirmed: identities.to_vec(),
        });
      }
    };
    let present: HashSet<String> = present.into_iter().map(|r| r.id).collect();
    let (unconfirmed, deleted): (Vec<String>, Vec<String>) =
      identities.iter().cloned().partition(|id| present.contains(id));

    self.remove_local(&scope, &deleted);
    if !unconfirmed.is_empty() {
      warn!(%scope, ids = ?unconfirmed, "server still reports deleted records");
    }
    Ok(BulkDeleteReport {
      deleted,
      unconfirmed,
    })
  }

  /// Undo a recent create by deleting it, if its window is still open.
  pub async fn undo_create(&self, identity: &str) -> Result<(), SyncError> {
    let scope = self.scope();
    let entry = self.lock().undo.take(&scope, identity)?;
    match self.delete_in(&scope, identity).await {
      Ok(()) => {
        info!(%scope, identity, "create undone");
        Ok(())
      }
      Err(e) => {
        self.lock().undo.reinstate(entry);
        Err(e)
      }
    }
  }

  /// Confirm a record against the server on demand. Promotes it to `Synced`
  /// when the server holds the same payload.
  pub async fn verify_product_saved(&self, identity: &str) -> Result<bool, SyncError> {
    let scope = self.scope();
    let local = {
      let st = self.lock();
      self.lookup(&st, &scope, identity)
    }
    .ok_or_else(|| SyncError::NotFound(identity.to_string()))?;

    let server = match self.read_one(&scope, identity).await? {
      Some(server) if server.same_payload(&local) => server,
      Some(_) => {
        debug!(identity, "server copy differs from local copy");
        return Ok(false);
      }
      None => return Ok(false),
    };

    let mut guard = self.lock();
    let st = &mut *guard;
    let still_same = self
      .lookup(st, &scope, identity)
      .is_some_and(|current| current.same_payload(&server));
    if !still_same {
      return Ok(false);
    }

    let verified = VerifiedRecord::from_server(server.clone());
    let states = st.states_mut(&scope);
    let promoted = match states.get(identity) {
      Some(SyncState::Verifying) => states.promote(&verified),
      _ => states.adopt(&verified),
    };
    if promoted.is_err() {
      debug!(identity, "write in flight; verification deferred");
      return Ok(false);
    }
    st.tracker.clear_local_only(&scope, identity);
    self.write_scope(st, &scope, |records| upsert(records, server));
    info!(identity, "verified against server");
    Ok(true)
  }

  // ---------------------------------------------------------------------
  // Conflicts
  // ---------------------------------------------------------------------

  /// Apply a human decision to a pending conflict. Returns the record as it
  /// now stands locally, or `None` when the resolution removed it.
  pub async fn resolve_conflict(
    &self,
    case_id: u64,
    choice: ResolutionChoice,
    merged: Option<Record>,
  ) -> Result<Option<Record>, SyncError> {
    let resolved = self.lock().conflicts.resolve(case_id, choice, merged)?;
    let case = resolved.case;
    let applied = self.apply_resolution(&case, resolved.resolution).await;

    if let Err(e) = &applied {
      let reopened = self.lock().conflicts.reopen(case);
      if let Some(reopened) = reopened {
        warn!(
          case = case_id,
          reopened = reopened.id,
          identity = %reopened.identity,
          error = %e,
          "resolution could not be applied, case reopened"
        );
      }
    }
    applied
  }

  async fn apply_resolution(
    &self,
    case: &ConflictCase,
    resolution: Resolution,
  ) -> Result<Option<Record>, SyncError> {
    let scope = case.scope.clone();
    let identity = case.identity.clone();

    let outcome = match resolution {
      Resolution::Adopt(server) => {
        if !self.adopt(&scope, server.clone()) {
          return Err(SyncError::Conflict { identity });
        }
        return Ok(Some(server));
      }
      Resolution::DropLocal => {
        self.remove_local(&scope, &[identity]);
        return Ok(None);
      }
      Resolution::Delete => {
        self.delete_in(&scope, &identity).await?;
        return Ok(None);
      }
      Resolution::Submit {
        record,
        known_version,
      } => {
        self
          .submit_update(&scope, record, Against::Version(known_version))
          .await
      }
      Resolution::Recreate(record) => {
        match self.prepare_update(&scope, record, Against::Version(None)) {
          Ok((ticket, _, _)) => self.submit_create(&ticket).await,
          Err(outcome) => outcome,
        }
      }
    };
    self.settle_phase(&outcome);

    match outcome {
      WriteOutcome::SavedRemote(record)
      | WriteOutcome::SavedUnverified { record, .. }
      | WriteOutcome::SavedLocalOnly { record, .. } => Ok(Some(record)),
      WriteOutcome::Conflict(case) => Err(SyncError::Conflict {
        identity: case.identity,
      }),
      WriteOutcome::Failed(e) => Err(e),
    }
  }

  // ---------------------------------------------------------------------
  // Reads
  // ---------------------------------------------------------------------

  /// Refresh the current scope from the server.
  ///
  /// Cached data is shown first. A fresh cache entry is served without a
  /// remote call unless `force` is set. When the server cannot be reached or
  /// answers with a suspicious empty list, the resolution chain supplies the
  /// data and a warning is raised instead of clearing the list.
  pub async fn refresh_products(&self, options: RefreshOptions) -> Result<RefreshReport, SyncError> {
    let started = *self.generation.borrow();

    let scope = {
      let mut guard = self.lock();
      let st = &mut *guard;
      let scope = st.scope.clone();

      if st.products.is_empty() {
        let resolved = self.resolver.resolve(&scope);
        if !resolved.is_empty() {
          debug!(%scope, from = ?resolved.from, "showing cached inventory");
          st.products = resolved.records;
        }
      }

      match self.resolver.lookup(&scope) {
        Some(hit) if hit.source == CacheSource::CacheFresh && !options.force => {
          st.loading = false;
          return Ok(RefreshReport {
            source: CacheSource::CacheFresh,
            count: st.products.len(),
            warning: None,
          });
        }
        Some(hit) if hit.source == CacheSource::CacheStale => {
          debug!(%scope, "serving stale cache while revalidating");
        }
        _ => {}
      }

      let first_load = !st.loaded.contains(&scope);
      st.loading = !options.silent || (first_load && st.products.is_empty());
      scope
    };

    let limit = self.settings.page_limit;
    let listed = retry("list", &self.settings.read_retry, || {
      self.load(started, self.remote.list(&scope, limit))
    })
    .await;

    match listed {
      Ok(remote) => self.apply_remote(started, &scope, remote),
      Err(SyncError::Cancelled) => {
        debug!(%scope, "refresh cancelled by scope switch");
        Err(SyncError::Cancelled)
      }
      Err(e) => self.fall_back(&scope, e),
    }
  }

  /// Push every local-only record of the current scope that the server does
  /// not have yet, at most `push_concurrency` at a time.
  pub async fn sync_local_inventory_to_api(&self) -> PushReport {
    let scope = self.scope();
    let tracked = self.lock().tracker.ids(&scope);
    if tracked.is_empty() {
      return PushReport::default();
    }

    let limit = self.settings.page_limit;
    let listed = retry("push-list", &self.settings.read_retry, || {
      self.call(self.remote.list(&scope, limit))
    })
    .await;
    let mut remote: HashMap<String, Record> = match listed {
      Ok(records) => records.into_iter().map(|r| (r.id.clone(), r)).collect(),
      Err(e) => {
        warn!(%scope, error = %e, "cannot reach server to push local-only records");
        let report = PushReport {
          failed: tracked.len(),
          total: tracked.len(),
          ..PushReport::default()
        };
        self.record_history(&scope, &report);
        return report;
      }
    };

    let mut landed = Vec::new();
    let mut tickets = Vec::new();
    {
      let mut guard = self.lock();
      let st = &mut *guard;
      for identity in tracked {
        let Some(local) = self.lookup(st, &scope, &identity) else {
          // Removed locally since it was marked.
          st.tracker.clear_local_only(&scope, &identity);
          st.states_mut(&scope).forget(&identity);
          continue;
        };
        if matches!(
          st.state_of(&scope, &identity),
          Some(SyncState::Saving | SyncState::Verifying)
        ) {
          continue;
        }
        let existing = remote.remove(&identity);
        if let Some(server) = existing.clone().filter(|s| s.same_payload(&local)) {
          // An earlier submission landed without being confirmed.
          let verified = VerifiedRecord::from_server(server.clone());
          if st.states_mut(&scope).adopt(&verified).is_ok() {
            st.tracker.clear_local_only(&scope, &identity);
            self.write_scope(st, &scope, |records| upsert(records, server));
            landed.push(identity);
          }
          continue;
        }
        match self.apply_optimistic(st, &scope, local) {
          Ok(ticket) => tickets.push((identity, (ticket, existing))),
          Err(e) => warn!(identity, error = %e, "cannot start push"),
        }
      }
    }

    let mut report = push_bounded(tickets, self.settings.push_concurrency, |identity, push| {
      self.push_one(identity, push)
    })
    .await;

    report.total += landed.len();
    report.synced += landed.len();
    report.synced_ids.extend(landed);
    report.synced_ids.sort();

    info!(
      %scope,
      synced = report.synced,
      failed = report.failed,
      total = report.total,
      "local-only push finished"
    );
    self.record_history(&scope, &report);
    report
  }

  // ---------------------------------------------------------------------
  // Pipeline internals
  // ---------------------------------------------------------------------

  async fn push_one(
    &self,
    identity: String,
    (ticket, existing): (OptimisticTicket, Option<Record>),
  ) -> Result<String, (String, SyncError)> {
    match self.push_create(&ticket).await {
      Ok(server) => {
        self.commit(&ticket, VerifiedRecord::from_server(server));
        Ok(identity)
      }
      Err(e @ SyncError::Conflict { .. }) => {
        self.push_conflict(&ticket, existing).await;
        Err((identity, e))
      }
      Err(e) => {
        let mut guard = self.lock();
        let st = &mut *guard;
        let settled = Snapshot {
          record: Some(ticket.applied.clone()),
          state: Some(SyncState::Error),
        };
        if st.sequencer.retire(&identity, ticket.seq, Some(settled)).is_some() {
          note(st.states_mut(&ticket.scope).transition(&identity, SyncState::Error));
        }
        Err((identity, e))
      }
    }
  }

  /// Create a local-only record on the server. A replayed earlier create
  /// that differs from the local copy is brought up to date with an update.
  async fn push_create(&self, ticket: &OptimisticTicket) -> Result<Record, SyncError> {
    let token = idempotency_token(&ticket.scope, &ticket.identity);
    let created = retry("push", &self.settings.push_retry, || {
      self.call(self.remote.create(&ticket.scope, &ticket.applied, &token))
    })
    .await?;

    let version = match created {
      WriteAck::Record(server) if server.same_payload(&ticket.applied) => return Ok(server),
      WriteAck::Record(server) => server.version,
      WriteAck::Acknowledged => return self.confirm_push(ticket).await,
    };
    debug!(identity = %ticket.identity, ?version, "earlier create landed, pushing local edits");
    let updated = retry("push-update", &self.settings.push_retry, || {
      self.call(self.remote.update(&ticket.scope, &ticket.applied, version))
    })
    .await?;

    match updated {
      WriteAck::Record(server) if server.same_payload(&ticket.applied) => Ok(server),
      WriteAck::Record(_) => Err(SyncError::VerificationFailure {
        identity: ticket.identity.clone(),
        reason: "server answered the push with a different copy".into(),
      }),
      WriteAck::Acknowledged => self.confirm_push(ticket).await,
    }
  }

  async fn confirm_push(&self, ticket: &OptimisticTicket) -> Result<Record, SyncError> {
    match self.read_one(&ticket.scope, &ticket.identity).await? {
      Some(server) if server.same_payload(&ticket.applied) => Ok(server),
      _ => Err(SyncError::VerificationFailure {
        identity: ticket.identity.clone(),
        reason: "server copy missing or different after push".into(),
      }),
    }
  }

  /// The identity is held by a server record this device did not create.
  async fn push_conflict(&self, ticket: &OptimisticTicket, listed: Option<Record>) {
    let server = self
      .read_one(&ticket.scope, &ticket.identity)
      .await
      .unwrap_or(listed);

    let mut guard = self.lock();
    let st = &mut *guard;
    if !st.sequencer.is_current(&ticket.identity, ticket.seq) {
      st.sequencer.retire(&ticket.identity, ticket.seq, None);
      return;
    }
    let on_server = server.is_some();
    let opened = st.conflicts.open(
      &ticket.scope,
      LocalSide::Edited(ticket.applied.clone()),
      server,
    );
    let next = if opened.is_some() {
      if on_server {
        st.tracker.clear_local_only(&ticket.scope, &ticket.identity);
      }
      SyncState::Conflict
    } else {
      SyncState::Error
    };
    let settled = Snapshot {
      record: Some(ticket.applied.clone()),
      state: Some(next),
    };
    st.sequencer.retire(&ticket.identity, ticket.seq, Some(settled));
    note(st.states_mut(&ticket.scope).transition(&ticket.identity, next));
  }

  /// Apply `applied` locally and in the cache, tagged `Saving`.
  fn apply_optimistic(
    &self,
    st: &mut EngineState,
    scope: &Scope,
    applied: Record,
  ) -> Result<OptimisticTicket, SyncError> {
    let identity = applied.id.clone();
    let previous = self.lookup(st, scope, &identity);
    let previous_state = st.states_mut(scope).begin_save(&identity).map_err(illegal)?;
    let seq = st.sequencer.issue(
      &identity,
      Snapshot {
        record: previous,
        state: previous_state,
      },
    );

    st.phase = SavePhase::ApplyingOptimistic;
    self.write_scope(st, scope, |records| upsert(records, applied.clone()));
    st.phase = SavePhase::Submitting;
    debug!(%scope, identity, seq, "applied optimistically");

    Ok(OptimisticTicket {
      scope: scope.clone(),
      identity,
      seq,
      applied,
    })
  }

  fn prepare_update(
    &self,
    scope: &Scope,
    record: Record,
    against: Against,
  ) -> Result<(OptimisticTicket, Option<u64>, bool), WriteOutcome> {
    let mut guard = self.lock();
    let st = &mut *guard;
    let current = self
      .lookup(st, scope, &record.id)
      .ok_or_else(|| WriteOutcome::Failed(SyncError::NotFound(record.id.clone())))?;

    let known = match against {
      Against::Local => current.version,
      Against::Version(v) => v,
    };
    let via_create = st.tracker.contains(scope, &record.id);

    let mut applied = record;
    applied.version = known;
    applied.updated_at = st.clock.now();
    let ticket = self
      .apply_optimistic(st, scope, applied)
      .map_err(WriteOutcome::Failed)?;
    Ok((ticket, known, via_create))
  }

  async fn submit_update(&self, scope: &Scope, record: Record, against: Against) -> WriteOutcome {
    let (ticket, known, via_create) = match self.prepare_update(scope, record, against) {
      Ok(prepared) => prepared,
      Err(outcome) => return outcome,
    };
    // Never reached the server: the update has to be a create.
    if via_create {
      return self.submit_create(&ticket).await;
    }
    let result = self
      .call(self.remote.update(&ticket.scope, &ticket.applied, known))
      .await;
    self.settle_update(&ticket, result).await
  }

  async fn submit_create(&self, ticket: &OptimisticTicket) -> WriteOutcome {
    let token = idempotency_token(&ticket.scope, &ticket.identity);
    let result = self
      .call(self.remote.create(&ticket.scope, &ticket.applied, &token))
      .await;

    match result {
      Ok(WriteAck::Record(server)) if server.same_payload(&ticket.applied) => {
        WriteOutcome::SavedRemote(self.commit(ticket, VerifiedRecord::from_server(server)))
      }
      // The token replayed an earlier submission of this create.
      Ok(WriteAck::Record(server)) => self.update_landed(ticket, server.version).await,
      Ok(WriteAck::Acknowledged) => self.verify_write(ticket).await,
      Err(e) if e.is_retryable() => self.keep_local_only(ticket, e.to_string()),
      Err(e) => {
        self.rollback(ticket);
        WriteOutcome::Failed(e)
      }
    }
  }

  /// Bring a create that reached the server unconfirmed up to the local
  /// value.
  async fn update_landed(&self, ticket: &OptimisticTicket, version: Option<u64>) -> WriteOutcome {
    debug!(identity = %ticket.identity, ?version, "earlier create landed, updating it");
    let result = self
      .call(self.remote.update(&ticket.scope, &ticket.applied, version))
      .await;
    match result {
      Err(e) if e.is_retryable() => self.keep_local_only(ticket, e.to_string()),
      other => self.settle_update(ticket, other).await,
    }
  }

  async fn settle_update(&self, ticket: &OptimisticTicket, result: Result<WriteAck, SyncError>) -> WriteOutcome {
    match result {
      Err(SyncError::Conflict { .. }) | Err(SyncError::NotFound(_)) => self.on_conflict(ticket).await,
      other => self.settle_plain(ticket, other).await,
    }
  }

  async fn settle_plain(&self, ticket: &OptimisticTicket, result: Result<WriteAck, SyncError>) -> WriteOutcome {
    match result {
      Ok(WriteAck::Record(server)) if server.same_payload(&ticket.applied) => {
        WriteOutcome::SavedRemote(self.commit(ticket, VerifiedRecord::from_server(server)))
      }
      Ok(WriteAck::Record(_)) => self.unverified(
        ticket,
        Some(SyncState::Error),
        false,
        "server answered with a different copy".into(),
      ),
      Ok(WriteAck::Acknowledged) => self.verify_write(ticket).await,
      Err(e) => {
        warn!(identity = %ticket.identity, error = %e, "write failed, rolling back");
        self.rollback(ticket);
        WriteOutcome::Failed(e)
      }
    }
  }

  /// The server only acknowledged the write: read it back before claiming
  /// anything. Failure keeps the optimistic value.
  async fn verify_write(&self, ticket: &OptimisticTicket) -> WriteOutcome {
    {
      let mut guard = self.lock();
      let st = &mut *guard;
      if st.sequencer.is_current(&ticket.identity, ticket.seq) {
        note(st.states_mut(&ticket.scope).transition(&ticket.identity, SyncState::Verifying));
      }
      st.phase = SavePhase::Verifying;
    }

    match self.read_one(&ticket.scope, &ticket.identity).await {
      Ok(Some(server)) if server.same_payload(&ticket.applied) => {
        WriteOutcome::SavedRemote(self.commit(ticket, VerifiedRecord::from_server(server)))
      }
      Ok(Some(_)) => self.unverified(
        ticket,
        Some(SyncState::Error),
        false,
        "server copy differs from the saved value".into(),
      ),
      Ok(None) => self.unverified(
        ticket,
        Some(SyncState::Error),
        true,
        "server does not have the record".into(),
      ),
      Err(e) => self.unverified(ticket, None, false, e.to_string()),
    }
  }

  fn unverified(
    &self,
    ticket: &OptimisticTicket,
    next: Option<SyncState>,
    mark_local_only: bool,
    reason: String,
  ) -> WriteOutcome {
    let mut guard = self.lock();
    let st = &mut *guard;
    if mark_local_only {
      st.tracker.mark_local_only(&ticket.scope, &ticket.identity);
    }
    let settled = Snapshot {
      record: Some(ticket.applied.clone()),
      state: Some(next.unwrap_or(SyncState::Verifying)),
    };
    if st.sequencer.retire(&ticket.identity, ticket.seq, Some(settled)).is_some() {
      if let Some(next) = next {
        note(st.states_mut(&ticket.scope).transition(&ticket.identity, next));
      }
    }
    warn!(identity = %ticket.identity, %reason, "saved but unverified");
    WriteOutcome::SavedUnverified {
      record: ticket.applied.clone(),
      reason,
    }
  }

  fn keep_local_only(&self, ticket: &OptimisticTicket, reason: String) -> WriteOutcome {
    let mut guard = self.lock();
    let st = &mut *guard;
    st.tracker.mark_local_only(&ticket.scope, &ticket.identity);
    let settled = Snapshot {
      record: Some(ticket.applied.clone()),
      state: Some(SyncState::LocalOnly),
    };
    if st.sequencer.retire(&ticket.identity, ticket.seq, Some(settled)).is_some() {
      note(st.states_mut(&ticket.scope).transition(&ticket.identity, SyncState::LocalOnly));
    }
    info!(identity = %ticket.identity, %reason, "kept on this device only");
    WriteOutcome::SavedLocalOnly {
      record: ticket.applied.clone(),
      reason,
    }
  }

  /// Commit a server-confirmed record. A resolution overtaken by a newer
  /// write is handed to that write instead of touching the local value.
  fn commit(&self, ticket: &OptimisticTicket, verified: VerifiedRecord) -> Record {
    let server = verified.record().clone();
    let mut guard = self.lock();
    let st = &mut *guard;
    st.clock.observe(server.updated_at, Utc::now());
    st.tracker.clear_local_only(&ticket.scope, &ticket.identity);

    let settled = Snapshot {
      record: Some(server.clone()),
      state: Some(SyncState::Synced),
    };
    if st
      .sequencer
      .retire(&ticket.identity, ticket.seq, Some(settled))
      .is_none()
    {
      debug!(identity = %ticket.identity, seq = ticket.seq, "newer write in flight, older commit not applied");
      return server;
    }

    note(st.states_mut(&ticket.scope).promote(&verified));
    self.write_scope(st, &ticket.scope, |records| upsert(records, server.clone()));
    debug!(identity = %ticket.identity, version = ?server.version, "committed");
    server
  }

  /// Restore what the write replaced, unless the write was overtaken.
  fn rollback(&self, ticket: &OptimisticTicket) -> bool {
    let mut guard = self.lock();
    let st = &mut *guard;
    let Some(base) = st.sequencer.retire(&ticket.identity, ticket.seq, None) else {
      debug!(identity = %ticket.identity, seq = ticket.seq, "stale rollback dropped");
      return false;
    };
    let current = self.lookup(st, &ticket.scope, &ticket.identity);
    if !ticket.still_applied(current.as_ref()) {
      debug!(identity = %ticket.identity, "local value changed since apply, rollback dropped");
      return false;
    }

    note(st.states_mut(&ticket.scope).restore(&ticket.identity, base.state));
    self.write_scope(st, &ticket.scope, |records| match base.record {
      Some(previous) => upsert(records, previous),
      None => records.retain(|r| r.id != ticket.identity),
    });
    info!(identity = %ticket.identity, "rolled back");
    true
  }

  /// The server rejected an update because its copy moved on or vanished.
  async fn on_conflict(&self, ticket: &OptimisticTicket) -> WriteOutcome {
    let conflict = SyncError::Conflict {
      identity: ticket.identity.clone(),
    };
    let server = match self.read_one(&ticket.scope, &ticket.identity).await {
      Ok(server) => server,
      Err(e) => {
        warn!(identity = %ticket.identity, error = %e, "could not fetch server copy after conflict");
        self.rollback(ticket);
        return WriteOutcome::Failed(conflict);
      }
    };

    let case = {
      let mut guard = self.lock();
      let st = &mut *guard;
      if !st.sequencer.is_current(&ticket.identity, ticket.seq) {
        st.sequencer.retire(&ticket.identity, ticket.seq, None);
        return WriteOutcome::Failed(conflict);
      }
      let opened = st.conflicts.open(
        &ticket.scope,
        LocalSide::Edited(ticket.applied.clone()),
        server.clone(),
      );
      if opened.is_some() {
        if server.is_some() {
          st.tracker.clear_local_only(&ticket.scope, &ticket.identity);
        }
        let settled = Snapshot {
          record: Some(ticket.applied.clone()),
          state: Some(SyncState::Conflict),
        };
        st.sequencer.retire(&ticket.identity, ticket.seq, Some(settled));
        note(st.states_mut(&ticket.scope).transition(&ticket.identity, SyncState::Conflict));
      }
      opened
    };

    let Some(case) = case else {
      return match server {
        Some(server) if server.same_payload(&ticket.applied) => {
          WriteOutcome::SavedRemote(self.commit(ticket, VerifiedRecord::from_server(server)))
        }
        _ => {
          self.rollback(ticket);
          WriteOutcome::Failed(conflict)
        }
      };
    };

    if let Err(e) = self.refresh_products(RefreshOptions::silent()).await {
      debug!(error = %e, "refresh after conflict failed");
    }

    if self.settings.auto_last_write_wins {
      return self.auto_resolve(case).await;
    }
    WriteOutcome::Conflict(case)
  }

  async fn auto_resolve(&self, case: ConflictCase) -> WriteOutcome {
    let resolved = self
      .lock()
      .conflicts
      .resolve(case.id, ResolutionChoice::LastWriteWins, None);
    let resolved = match resolved {
      Ok(resolved) => resolved,
      Err(e) => return WriteOutcome::Failed(e),
    };

    match resolved.resolution {
      Resolution::Adopt(server) => {
        if self.adopt(&case.scope, server.clone()) {
          WriteOutcome::SavedRemote(server)
        } else {
          WriteOutcome::Conflict(case)
        }
      }
      Resolution::Submit {
        record,
        known_version,
      } => {
        let ticket = match self.prepare_update(&case.scope, record, Against::Version(known_version)) {
          Ok((ticket, _, _)) => ticket,
          Err(outcome) => return outcome,
        };
        let result = self
          .call(self.remote.update(&ticket.scope, &ticket.applied, known_version))
          .await;
        self.settle_plain(&ticket, result).await
      }
      _ => WriteOutcome::Conflict(case),
    }
  }

  /// Replace the local copy with the server's.
  fn adopt(&self, scope: &Scope, server: Record) -> bool {
    let verified = VerifiedRecord::from_server(server.clone());
    let mut guard = self.lock();
    let st = &mut *guard;
    if let Err(err) = st.states_mut(scope).adopt(&verified) {
      warn!(%err, "cannot adopt server copy while a write is in flight");
      return false;
    }
    st.tracker.clear_local_only(scope, &server.id);
    self.write_scope(st, scope, |records| upsert(records, server));
    true
  }

  async fn delete_in(&self, scope: &Scope, identity: &str) -> Result<(), SyncError> {
    let local = {
      let st = self.lock();
      self.lookup(&st, scope, identity)
    }
    .ok_or_else(|| SyncError::NotFound(identity.to_string()))?;

    match self.call(self.remote.delete(scope, identity)).await {
      Ok(()) | Err(SyncError::NotFound(_)) => {}
      Err(e) => {
        warn!(%scope, identity, error = %e, "delete failed");
        return Err(e);
      }
    }

    let unconfirmed = SyncError::DeleteUnconfirmed {
      identity: identity.to_string(),
    };
    let present = match self.still_present(scope, &[identity.to_string()]).await {
      Ok(present) => present,
      Err(e) => {
        warn!(%scope, identity, error = %e, "could not confirm delete");
        return Err(unconfirmed);
      }
    };

    if let Some(server) = present.into_iter().next() {
      warn!(%scope, identity, "server still reports deleted record");
      if !server.same_payload(&local) {
        let mut st = self.lock();
        st.conflicts.open(scope, LocalSide::Deleted(local), Some(server));
      }
      return Err(unconfirmed);
    }

    self.remove_local(scope, &[identity.to_string()]);
    info!(%scope, identity, "deleted");
    Ok(())
  }

  /// Records among `identities` the server still has, read over the full
  /// scope.
  async fn still_present(&self, scope: &Scope, identities: &[String]) -> Result<Vec<Record>, SyncError> {
    let limit = self.settings.page_limit;
    let listed = retry("verify-delete", &self.settings.read_retry, || {
      self.call(self.remote.list(scope, limit))
    })
    .await?;

    let wanted: HashSet<&str> = identities.iter().map(String::as_str).collect();
    let mut present: Vec<Record> = listed
      .iter()
      .filter(|r| wanted.contains(r.id.as_str()))
      .cloned()
      .collect();

    // A full page may hide the rest of the scope.
    if listed.len() >= limit {
      let seen: HashSet<String> = present.iter().map(|r| r.id.clone()).collect();
      for identity in identities.iter().filter(|id| !seen.contains(*id)) {
        if let Some(record) = self.read_one(scope, identity).await? {
          present.push(record);
        }
      }
    }
    Ok(present)
  }

  fn remove_local(&self, scope: &Scope, identities: &[String]) {
    if identities.is_empty() {
      return;
    }
    let mut guard = self.lock();
    let st = &mut *guard;
    self.write_scope(st, scope, |records| {
      records.retain(|r| !identities.contains(&r.id))
    });
    for identity in identities {
      st.states_mut(scope).forget(identity);
      st.tracker.clear_local_only(scope, identity);
      st.undo.forget(scope, identity);
    }
  }

  fn apply_remote(&self, started: u64, scope: &Scope, remote: Vec<Record>) -> Result<RefreshReport, SyncError> {
    let mut guard = self.lock();
    let st = &mut *guard;
    if *self.generation.borrow() != started || st.scope != *scope {
      return Err(SyncError::Cancelled);
    }

    let tracked: HashSet<String> = st.tracker.ids(scope).into_iter().collect();
    let local_only: Vec<Record> = st
      .products
      .iter()
      .filter(|r| tracked.contains(&r.id))
      .cloned()
      .collect();
    let pinned: Vec<Record> = st
      .products
      .iter()
      .filter(|r| {
        matches!(
          st.state_of(scope, &r.id),
          Some(SyncState::Saving | SyncState::Verifying | SyncState::Conflict)
        )
      })
      .cloned()
      .collect();
    let pinned_ids: HashSet<String> = pinned.iter().map(|r| r.id.clone()).collect();

    let had_data = !st.products.is_empty() || self.resolver.has_data(scope);
    let merged = overlay(merge(remote.clone(), local_only), pinned);

    if is_suspicious_empty(&merged, had_data) {
      let warning = format!(
        "server returned no records for {}; keeping the cached inventory",
        scope
      );
      warn!(%scope, "suspicious empty list from server");
      if st.products.is_empty() {
        st.products = self.resolver.resolve(scope).records;
      }
      st.loading = false;
      st.warn(warning.clone());
      return Ok(RefreshReport {
        source: CacheSource::Offline,
        count: st.products.len(),
        warning: Some(warning),
      });
    }

    for record in remote.iter().filter(|r| !pinned_ids.contains(&r.id)) {
      if tracked.contains(&record.id) {
        st.tracker.clear_local_only(scope, &record.id);
      }
      note(
        st.states_mut(scope)
          .adopt(&VerifiedRecord::from_server(record.clone())),
      );
    }
    let kept: HashSet<&str> = merged.iter().map(|r| r.id.as_str()).collect();
    let gone: Vec<String> = st
      .products
      .iter()
      .filter(|r| !kept.contains(r.id.as_str()))
      .map(|r| r.id.clone())
      .collect();
    for identity in &gone {
      st.states_mut(scope).forget(identity);
    }

    st.products = merged;
    if !self.cache.write_fetched(scope, &st.products).ok {
      st.warn(SyncError::StorageQuotaExceeded.to_string());
    }
    st.loaded.insert(scope.clone());
    st.loading = false;
    st.error = None;
    info!(%scope, count = st.products.len(), "inventory refreshed");

    Ok(RefreshReport {
      source: CacheSource::Network,
      count: st.products.len(),
      warning: None,
    })
  }

  fn fall_back(&self, scope: &Scope, err: SyncError) -> Result<RefreshReport, SyncError> {
    let mut guard = self.lock();
    let st = &mut *guard;
    st.loading = false;
    if st.scope != *scope {
      return Err(err);
    }

    if st.products.is_empty() {
      let resolved = self.resolver.resolve(scope);
      st.products = resolved.records;
    }
    if st.products.is_empty() {
      warn!(%scope, error = %err, "refresh failed with nothing cached");
      st.error = Some(err.clone());
      return Err(err);
    }

    let warning = format!("could not reach the inventory server ({}); showing cached data", err);
    warn!(%scope, error = %err, count = st.products.len(), "refresh failed, serving cache");
    st.warn(warning.clone());
    Ok(RefreshReport {
      source: CacheSource::Offline,
      count: st.products.len(),
      warning: Some(warning),
    })
  }

  // ---------------------------------------------------------------------
  // Helpers
  // ---------------------------------------------------------------------

  /// Remote call with the per-call timeout.
  async fn call<T>(&self, fut: impl Future<Output = Result<T, RemoteError>>) -> Result<T, SyncError> {
    match tokio::time::timeout(self.settings.call_timeout, fut).await {
      Ok(result) => result.map_err(SyncError::from),
      Err(_) => Err(SyncError::Timeout(self.settings.call_timeout)),
    }
  }

  /// Remote call that is abandoned when the scope changes.
  async fn load<T>(&self, started: u64, fut: impl Future<Output = Result<T, RemoteError>>) -> Result<T, SyncError> {
    let mut generation = self.generation.subscribe();
    tokio::select! {
      result = self.call(fut) => result,
      _ = generation.wait_for(|g| *g != started) => Err(SyncError::Cancelled),
    }
  }

  async fn read_one(&self, scope: &Scope, identity: &str) -> Result<Option<Record>, SyncError> {
    retry("verify", &self.settings.read_retry, || {
      self.call(self.remote.get(scope, identity))
    })
    .await
  }

  fn lookup(&self, st: &EngineState, scope: &Scope, identity: &str) -> Option<Record> {
    if st.scope == *scope {
      st.products.iter().find(|r| r.id == identity).cloned()
    } else {
      self.cache.read(scope).into_iter().find(|r| r.id == identity)
    }
  }

  /// Edit the full record list of `scope` and persist all of it.
  fn write_scope(&self, st: &mut EngineState, scope: &Scope, edit: impl FnOnce(&mut Vec<Record>)) {
    let outcome = if st.scope == *scope {
      edit(&mut st.products);
      self.cache.write(scope, &st.products)
    } else {
      let mut records = self.cache.read(scope);
      edit(&mut records);
      self.cache.write(scope, &records)
    };
    if !outcome.ok {
      st.warn(SyncError::StorageQuotaExceeded.to_string());
    }
  }

  fn settle_phase(&self, outcome: &WriteOutcome) {
    let phase = match outcome {
      WriteOutcome::SavedRemote(_) => SavePhase::Committed,
      WriteOutcome::SavedLocalOnly { .. } => SavePhase::SavedLocally,
      WriteOutcome::SavedUnverified { .. } | WriteOutcome::Conflict(_) => SavePhase::Error,
      WriteOutcome::Failed(_) => SavePhase::RolledBack,
    };
    self.lock().phase = phase;
  }

  fn record_history(&self, scope: &Scope, report: &PushReport) {
    let mut history = self.sync_history();
    history.push(SyncHistoryEntry {
      at: Utc::now(),
      scope: scope.clone(),
      report: report.clone(),
    });
    let excess = history.len().saturating_sub(SYNC_HISTORY_LIMIT);
    history.drain(..excess);

    match serde_json::to_vec(&history) {
      Ok(data) => {
        self.cache.write_blob(SYNC_HISTORY_KEY, &data);
      }
      Err(e) => warn!(error = %e, "failed to serialise sync history"),
    }
  }
}
