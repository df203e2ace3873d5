//! Inventory records, scopes and idempotency tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::SyncError;

/// Cache key of the unscoped entry kept for migration compatibility.
pub const LEGACY_CACHE_KEY: &str = "inventory";

const SCOPED_CACHE_PREFIX: &str = "inventory:";

/// A partition key (e.g. a warehouse) under which records are cached and
/// synchronized independently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Durable cache key for this scope's entry.
  pub fn cache_key(&self) -> String {
    format!("{}{}", SCOPED_CACHE_PREFIX, self.0)
  }

  /// Recover the scope from a scoped cache key. The legacy key yields `None`.
  pub fn from_cache_key(key: &str) -> Option<Self> {
    key
      .strip_prefix(SCOPED_CACHE_PREFIX)
      .filter(|s| !s.is_empty())
      .map(Self::new)
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Scope {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

/// A cached inventory entity such as a stock-keeping unit.
///
/// Business fields are kept as an open JSON map; the sync core only interprets
/// `id`, `version` and `updatedAt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  /// Stable opaque identity, unique within a scope and never reused.
  pub id: String,
  /// Server-advanced version used for optimistic concurrency.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<u64>,
  #[serde(rename = "updatedAt", default = "Utc::now")]
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Record {
  pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      version: None,
      updated_at: Utc::now(),
      fields,
    }
  }

  /// Build a record from a JSON object literal. Non-object values yield an
  /// empty field map.
  pub fn from_json(id: impl Into<String>, value: Value) -> Self {
    let fields = match value {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    Self::new(id, fields)
  }

  pub fn with_version(mut self, version: u64) -> Self {
    self.version = Some(version);
    self
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  /// Whether two records carry the same business payload. Version and
  /// timestamp are server bookkeeping and are ignored.
  pub fn same_payload(&self, other: &Record) -> bool {
    self.id == other.id && self.fields == other.fields
  }

  /// Reject records the remote store would refuse outright.
  pub fn validate(&self) -> Result<(), SyncError> {
    if self.id.trim().is_empty() {
      return Err(SyncError::Validation("record identity is empty".into()));
    }
    if self.id.chars().any(char::is_control) {
      return Err(SyncError::Validation(format!(
        "record identity {:?} contains control characters",
        self.id
      )));
    }
    for reserved in ["id", "version", "updatedAt"] {
      if self.fields.contains_key(reserved) {
        return Err(SyncError::Validation(format!(
          "field '{}' is reserved on '{}'",
          reserved, self.id
        )));
      }
    }
    Ok(())
  }

  /// Short, bounded rendering of the payload for audit entries.
  pub fn summary(&self) -> String {
    const MAX: usize = 160;
    let mut text = format!(
      "{} v{} {}",
      self.id,
      self
        .version
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".into()),
      Value::Object(self.fields.clone())
    );
    if text.len() > MAX {
      let mut cut = MAX;
      while !text.is_char_boundary(cut) {
        cut -= 1;
      }
      text.truncate(cut);
      text.push('…');
    }
    text
  }
}

/// Idempotency token for creating `identity` in `scope`.
///
/// Derived from the identity so that every retry of the same logical create
/// carries the same token.
pub fn idempotency_token(scope: &Scope, identity: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(b"create:");
  hasher.update(scope.as_str().as_bytes());
  hasher.update(b":");
  hasher.update(identity.as_bytes());
  hex::encode(hasher.finalize())
}
