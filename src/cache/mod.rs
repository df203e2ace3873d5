//! Durable cache tier and cache resolution chain.
//!
//! This module provides:
//! - A primary quota-bounded file store, a structured SQLite fallback and an
//!   in-memory overflow, combined by [`DurableCache`]
//! - Eviction of clearable, purely derived keys when space runs out
//! - [`CacheResolver`], which finds the best available snapshot for a scope
//!   (scoped entry, legacy entry, union of all scopes)

mod file;
mod layer;
mod memory;
mod storage;
mod tier;
mod traits;

pub use file::FileStorage;
pub use layer::{CacheResolver, Resolved, ResolvedFrom};
pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use tier::{DurableCache, PersistOutcome, Tier};
pub use traits::{CacheEntry, CacheResult, CacheSource, CacheStorage, StorageError};
