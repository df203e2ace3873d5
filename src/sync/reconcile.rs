//! Read reconciliation: combine the remote list with records only this
//! device knows about.

use std::collections::{HashMap, HashSet};

use super::record::Record;

/// Merge the remote list with local-only records. The remote copy wins on an
/// identity collision; local-only records the server lacks are appended in
/// their local order.
pub fn merge(remote: Vec<Record>, local_only: Vec<Record>) -> Vec<Record> {
  let known: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();
  let mut merged = remote;
  merged.extend(local_only.into_iter().filter(|r| !known.contains(&r.id)));
  merged
}

/// Lay local copies over a merged list, replacing by identity. Used for
/// records with a write in flight or an open conflict, whose local value must
/// not be clobbered by a concurrent refresh.
pub fn overlay(merged: Vec<Record>, pinned: Vec<Record>) -> Vec<Record> {
  if pinned.is_empty() {
    return merged;
  }
  let mut pinned: HashMap<String, Record> = pinned.into_iter().map(|r| (r.id.clone(), r)).collect();
  let mut out: Vec<Record> = merged
    .into_iter()
    .map(|r| pinned.remove(&r.id).unwrap_or(r))
    .collect();
  let mut rest: Vec<Record> = pinned.into_values().collect();
  rest.sort_by(|a, b| a.id.cmp(&b.id));
  out.extend(rest);
  out
}

/// An empty merge for a scope that previously had data looks like an outage,
/// not a wiped inventory.
pub fn is_suspicious_empty(merged: &[Record], had_data: bool) -> bool {
  merged.is_empty() && had_data
}
