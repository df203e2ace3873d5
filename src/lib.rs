//! Offline-first inventory synchronization core.
//!
//! `stockroom` keeps a locally cached copy of inventory records in step with a
//! single authoritative remote store. Clients keep working while offline,
//! writes are only reported as saved once the server confirms them, and
//! outages never present an empty inventory when cached data exists.
//!
//! - [`cache`]: durable cache tier and the cache resolution chain
//! - [`remote`]: the remote store boundary (HTTP client, in-memory store, retry)
//! - [`sync`]: write pipeline, local-only tracker, conflict resolver,
//!   reconciliation, undo window and the resync scheduler
//! - [`config`]: YAML configuration
//! - [`logging`]: tracing subscriber setup for the binary

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod sync;

pub use cache::{CacheResolver, DurableCache};
pub use config::Config;
pub use error::SyncError;
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteStore};
pub use sync::{
  BulkDeleteReport, ConflictCase, ConflictKind, EngineSettings, PushReport, Record,
  RefreshOptions, ResolutionChoice, ResyncScheduler, SavePhase, Scope, SyncEngine, SyncState,
  Trigger, WriteOutcome,
};
