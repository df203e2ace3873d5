//! Remote store contract and its error type.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::sync::{Record, Scope};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
  /// 400/422: the server refused the payload.
  #[error("rejected by server: {0}")]
  Validation(String),
  /// 401: session invalid.
  #[error("unauthorized: {0}")]
  Unauthorized(String),
  /// 403: hard denial, never retried.
  #[error("forbidden: {0}")]
  Forbidden(String),
  #[error("not found: {0}")]
  NotFound(String),
  /// 409/412: the version the client edited against is stale.
  #[error("version conflict on '{identity}' (server at {server_version:?})")]
  Conflict {
    identity: String,
    server_version: Option<u64>,
  },
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },
  #[error("network error: {0}")]
  Network(String),
  #[error("timed out after {0:?}")]
  Timeout(Duration),
}

impl RemoteError {
  /// 5xx, transport failures and timeouts may succeed on a later attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      RemoteError::Server { .. } | RemoteError::Network(_) | RemoteError::Timeout(_)
    )
  }

  /// Map a non-success HTTP status onto the taxonomy.
  pub fn from_status(status: u16, identity: &str, body: String) -> Self {
    match status {
      400 | 422 => RemoteError::Validation(body),
      401 => RemoteError::Unauthorized(body),
      403 => RemoteError::Forbidden(body),
      404 => RemoteError::NotFound(identity.to_string()),
      409 | 412 => RemoteError::Conflict {
        identity: identity.to_string(),
        server_version: None,
      },
      _ => RemoteError::Server {
        status,
        message: body,
      },
    }
  }
}

/// What the server returned for a create or update.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAck {
  /// The full authoritative record; counts as verified.
  Record(Record),
  /// A bare acknowledgement; a verification read is still required.
  Acknowledged,
}

/// Remote store operations consumed by the sync core. Every call is scoped by
/// a partition key.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn list(&self, scope: &Scope, limit: usize) -> Result<Vec<Record>, RemoteError>;

  async fn get(&self, scope: &Scope, identity: &str) -> Result<Option<Record>, RemoteError>;

  /// Create with an idempotency token; a repeated token never duplicates.
  async fn create(
    &self,
    scope: &Scope,
    record: &Record,
    idempotency_token: &str,
  ) -> Result<WriteAck, RemoteError>;

  /// Update carrying the version the client edited against.
  async fn update(
    &self,
    scope: &Scope,
    record: &Record,
    known_version: Option<u64>,
  ) -> Result<WriteAck, RemoteError>;

  async fn delete(&self, scope: &Scope, identity: &str) -> Result<(), RemoteError>;

  /// Bulk delete. Default implementation falls back to sequential deletes,
  /// treating already-absent identities as deleted.
  async fn delete_many(&self, scope: &Scope, identities: &[String]) -> Result<(), RemoteError> {
    for identity in identities {
      match self.delete(scope, identity).await {
        Ok(()) | Err(RemoteError::NotFound(_)) => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert!(matches!(
      RemoteError::from_status(409, "p1", String::new()),
      RemoteError::Conflict { .. }
    ));
    assert!(matches!(
      RemoteError::from_status(403, "p1", String::new()),
      RemoteError::Forbidden(_)
    ));
    assert!(RemoteError::from_status(502, "p1", "bad gateway".into()).is_retryable());
    assert!(!RemoteError::from_status(401, "p1", String::new()).is_retryable());
    assert!(!RemoteError::from_status(422, "p1", String::new()).is_retryable());
  }
}
