//! Cache resolution chain: find the best available snapshot for a scope.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::tier::DurableCache;
use super::traits::{CacheEntry, CacheResult};
use crate::sync::{Record, Scope, LEGACY_CACHE_KEY};

/// Which step of the chain produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
  /// The scope's own entry.
  Scoped,
  /// The legacy unscoped entry.
  Legacy,
  /// The union of every known scoped entry.
  Union,
  /// Nothing cached anywhere.
  Empty,
}

#[derive(Debug, Clone)]
pub struct Resolved {
  pub records: Vec<Record>,
  pub from: ResolvedFrom,
  pub captured_at: Option<DateTime<Utc>>,
}

impl Resolved {
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

/// Read-side logic over the durable cache.
///
/// A changed partition key, a backend outage or a never-populated scope must
/// not present an empty inventory while any prior data exists.
pub struct CacheResolver {
  cache: Arc<DurableCache>,
  /// How long a snapshot may be served without a remote call
  freshness: Duration,
}

impl CacheResolver {
  pub fn new(cache: Arc<DurableCache>) -> Self {
    Self {
      cache,
      freshness: Duration::minutes(5),
    }
  }

  pub fn with_freshness(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  pub fn freshness(&self) -> Duration {
    self.freshness
  }

  /// The scope's own snapshot, tagged fresh or stale by the age of its last
  /// server fetch.
  pub fn lookup(&self, scope: &Scope) -> Option<CacheResult<Vec<Record>>> {
    let entry = self.cache.read_entry(&scope.cache_key())?;
    let stale = !entry.is_fresh(self.freshness);
    Some(CacheResult::from_cache(entry.payload, entry.captured_at, stale))
  }

  /// Resolve records for `scope`:
  ///
  /// 1. the scoped entry
  /// 2. if empty, the legacy unscoped entry
  /// 3. if still empty, every scoped entry merged and de-duplicated by
  ///    identity (last seen wins)
  pub fn resolve(&self, scope: &Scope) -> Resolved {
    if let Some(entry) = self.non_empty(&scope.cache_key()) {
      return Resolved {
        records: entry.payload,
        from: ResolvedFrom::Scoped,
        captured_at: Some(entry.captured_at),
      };
    }

    if let Some(entry) = self.non_empty(LEGACY_CACHE_KEY) {
      info!(scope = %scope, "scope cache empty, using legacy entry");
      return Resolved {
        records: entry.payload,
        from: ResolvedFrom::Legacy,
        captured_at: Some(entry.captured_at),
      };
    }

    let mut entries = self.cache.scoped_entries();
    entries.sort_by_key(|e| e.captured_at);
    let captured_at = entries.iter().map(|e| e.captured_at).max();
    let records = union_by_identity(entries.into_iter().flat_map(|e| e.payload));

    if records.is_empty() {
      debug!(scope = %scope, "nothing cached for scope");
      return Resolved {
        records,
        from: ResolvedFrom::Empty,
        captured_at: None,
      };
    }

    info!(scope = %scope, count = records.len(), "scope cache empty, using union of all scopes");
    Resolved {
      records,
      from: ResolvedFrom::Union,
      captured_at,
    }
  }

  /// Whether any step of the chain has data for `scope`.
  pub fn has_data(&self, scope: &Scope) -> bool {
    !self.resolve(scope).is_empty()
  }

  fn non_empty(&self, key: &str) -> Option<CacheEntry> {
    self.cache.read_entry(key).filter(|e| !e.is_empty())
  }
}

/// De-duplicate by identity keeping first-seen order; later copies replace
/// earlier ones.
fn union_by_identity(records: impl IntoIterator<Item = Record>) -> Vec<Record> {
  let mut index: HashMap<String, usize> = HashMap::new();
  let mut out: Vec<Record> = Vec::new();
  for record in records {
    match index.get(&record.id) {
      Some(&i) => out[i] = record,
      None => {
        index.insert(record.id.clone(), out.len());
        out.push(record);
      }
    }
  }
  out
}
