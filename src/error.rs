//! Error taxonomy surfaced by the sync core.

use std::time::Duration;
use thiserror::Error;

use crate::remote::{RemoteError, Retryable};

/// Errors reported by [`SyncEngine`](crate::SyncEngine) operations.
///
/// Validation and permission errors are final. Network and timeout errors
/// are retried only for idempotent reads and the local-only push.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("version conflict on '{identity}'")]
  Conflict { identity: String },

  #[error("'{identity}' was saved but could not be confirmed, refresh to confirm: {reason}")]
  VerificationFailure { identity: String, reason: String },

  #[error("delete of '{identity}' is unconfirmed: the server still reports it")]
  DeleteUnconfirmed { identity: String },

  #[error("local storage is full; changes are kept in memory only until reload")]
  StorageQuotaExceeded,

  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("session is no longer valid: {0}")]
  SessionInvalid(String),

  #[error("request cancelled after a scope change")]
  Cancelled,

  #[error("'{0}' not found")]
  NotFound(String),

  #[error("conflict #{0} is already resolved")]
  AlreadyResolved(u64),

  #[error("undo window for '{0}' has expired")]
  UndoExpired(String),
}

impl SyncError {
  /// Whether the failure is transient and a later attempt may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
  }
}

impl Retryable for SyncError {
  fn is_retryable(&self) -> bool {
    SyncError::is_retryable(self)
  }
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Validation(msg) => SyncError::Validation(msg),
      RemoteError::Unauthorized(msg) => SyncError::SessionInvalid(msg),
      RemoteError::Forbidden(msg) => SyncError::PermissionDenied(msg),
      RemoteError::NotFound(what) => SyncError::NotFound(what),
      RemoteError::Conflict { identity, .. } => SyncError::Conflict { identity },
      RemoteError::Server { status, message } => {
        SyncError::Network(format!("server error {}: {}", status, message))
      }
      RemoteError::Network(msg) => SyncError::Network(msg),
      RemoteError::Timeout(after) => SyncError::Timeout(after),
    }
  }
}
