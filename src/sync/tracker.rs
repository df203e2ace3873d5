//! Local-only tracker: identities that exist on this device only.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::record::Scope;
use crate::cache::DurableCache;

/// Durable key of the local-only identity set.
pub const LOCAL_ONLY_KEY: &str = "local_only";

/// Summary of one push of local-only records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
  pub synced: usize,
  pub failed: usize,
  pub total: usize,
  pub synced_ids: Vec<String>,
}

/// Set of local-only identities per scope, persisted on every change so that
/// a reload still knows what has to be pushed.
pub struct LocalOnlyTracker {
  ids: BTreeMap<Scope, BTreeSet<String>>,
  cache: Arc<DurableCache>,
}

impl LocalOnlyTracker {
  /// Restore the set from the durable cache. Unreadable data starts empty.
  pub fn load(cache: Arc<DurableCache>) -> Self {
    let ids = cache
      .read_blob(LOCAL_ONLY_KEY)
      .and_then(|data| match serde_json::from_slice(&data) {
        Ok(ids) => Some(ids),
        Err(e) => {
          warn!(error = %e, "discarding malformed local-only set");
          None
        }
      })
      .unwrap_or_default();
    Self { ids, cache }
  }

  pub fn mark_local_only(&mut self, scope: &Scope, identity: &str) {
    if self
      .ids
      .entry(scope.clone())
      .or_default()
      .insert(identity.to_string())
    {
      debug!(%scope, identity, "marked local-only");
      self.persist();
    }
  }

  pub fn clear_local_only(&mut self, scope: &Scope, identity: &str) {
    let removed = match self.ids.get_mut(scope) {
      Some(set) => set.remove(identity),
      None => false,
    };
    if removed {
      self.ids.retain(|_, set| !set.is_empty());
      debug!(%scope, identity, "cleared local-only");
      self.persist();
    }
  }

  pub fn contains(&self, scope: &Scope, identity: &str) -> bool {
    self.ids.get(scope).is_some_and(|set| set.contains(identity))
  }

  /// Local-only identities across every scope.
  pub fn count(&self) -> usize {
    self.ids.values().map(BTreeSet::len).sum()
  }

  pub fn count_in(&self, scope: &Scope) -> usize {
    self.ids.get(scope).map_or(0, BTreeSet::len)
  }

  pub fn ids(&self, scope: &Scope) -> Vec<String> {
    self
      .ids
      .get(scope)
      .map(|set| set.iter().cloned().collect())
      .unwrap_or_default()
  }

  fn persist(&self) {
    let data = match serde_json::to_vec(&self.ids) {
      Ok(data) => data,
      Err(e) => {
        warn!(error = %e, "failed to serialise local-only set");
        return;
      }
    };
    let outcome = self.cache.write_blob(LOCAL_ONLY_KEY, &data);
    if !outcome.ok {
      warn!("local-only set is held in memory only");
    }
  }
}

/// Submit every item with at most `concurrency` in flight. A failure is
/// counted and never stops its siblings.
pub async fn push_bounded<T, F, Fut, E>(items: Vec<(String, T)>, concurrency: usize, submit: F) -> PushReport
where
  F: Fn(String, T) -> Fut,
  Fut: Future<Output = Result<String, (String, E)>>,
  E: std::fmt::Display,
{
  let total = items.len();
  let results: Vec<_> = stream::iter(items)
    .map(|(identity, item)| submit(identity, item))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

  let mut report = PushReport {
    total,
    ..PushReport::default()
  };
  for result in results {
    match result {
      Ok(identity) => {
        report.synced += 1;
        report.synced_ids.push(identity);
      }
      Err((identity, e)) => {
        warn!(identity, error = %e, "push of local-only record failed");
        report.failed += 1;
      }
    }
  }
  report.synced_ids.sort();
  report
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[test]
  fn test_mark_and_clear() {
    let cache = Arc::new(DurableCache::in_memory());
    let mut tracker = LocalOnlyTracker::load(cache);
    let scope = Scope::new("wh-1");

    tracker.mark_local_only(&scope, "p1");
    tracker.mark_local_only(&scope, "p1");
    tracker.mark_local_only(&Scope::new("wh-2"), "p7");
    assert_eq!(tracker.count(), 2);
    assert_eq!(tracker.count_in(&scope), 1);
    assert!(tracker.contains(&scope, "p1"));
    assert!(!tracker.contains(&Scope::new("wh-2"), "p1"));

    tracker.clear_local_only(&scope, "p1");
    assert_eq!(tracker.count_in(&scope), 0);
    assert!(tracker.ids(&scope).is_empty());
  }

  #[test]
  fn test_set_survives_reload() {
    let cache = Arc::new(DurableCache::in_memory());
    let scope = Scope::new("wh-1");
    {
      let mut tracker = LocalOnlyTracker::load(cache.clone());
      tracker.mark_local_only(&scope, "p1");
      tracker.mark_local_only(&scope, "p2");
    }

    let tracker = LocalOnlyTracker::load(cache);
    assert_eq!(tracker.ids(&scope), vec!["p1", "p2"]);
  }

  #[test]
  fn test_malformed_set_starts_empty() {
    let cache = Arc::new(DurableCache::in_memory());
    cache.write_blob(LOCAL_ONLY_KEY, b"[not json");
    assert_eq!(LocalOnlyTracker::load(cache).count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_push_respects_concurrency_cap() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let items: Vec<(String, u32)> = (0..12).map(|i| (format!("p{:02}", i), i)).collect();

    let report = push_bounded(items, 5, |identity, n| {
      let in_flight = in_flight.clone();
      let peak = peak.clone();
      async move {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        if n % 4 == 3 {
          Err((identity, "backend unavailable"))
        } else {
          Ok(identity)
        }
      }
    })
    .await;

    assert_eq!(peak.load(Ordering::SeqCst), 5);
    assert_eq!(report.total, 12);
    assert_eq!(report.failed, 3);
    assert_eq!(report.synced, 9);
    assert_eq!(report.synced_ids.first().map(String::as_str), Some("p00"));
  }
}
