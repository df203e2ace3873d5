//! Retry with exponential backoff for idempotent remote calls.
//!
//! Only reads and the bounded local-only push go through here. Interactive
//! creates and updates are submitted once.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::types::RemoteError;

/// Errors that know whether another attempt could help.
pub trait Retryable {
  fn is_retryable(&self) -> bool;
}

impl Retryable for RemoteError {
  fn is_retryable(&self) -> bool {
    RemoteError::is_retryable(self)
  }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub factor: f64,
  /// Total attempts including the first one.
  pub max_attempts: usize,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self::read()
  }
}

impl RetryConfig {
  /// Quick retry for verification and list reads.
  #[must_use]
  pub fn read() -> Self {
    Self {
      max_attempts: 3,
      initial_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(4),
      factor: 2.0,
    }
  }

  /// Background push of local-only records; a little more patient.
  #[must_use]
  pub fn push() -> Self {
    Self {
      max_attempts: 4,
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
      factor: 2.0,
    }
  }

  /// Single attempt, no backoff.
  #[must_use]
  pub fn once() -> Self {
    Self {
      max_attempts: 1,
      initial_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      factor: 1.0,
    }
  }

  #[must_use]
  pub fn with_max_attempts(mut self, attempts: usize) -> Self {
    self.max_attempts = attempts.max(1);
    self
  }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_attempts`.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Retryable + std::fmt::Display,
{
  let mut delay = config.initial_delay;
  let mut attempts = 0;

  loop {
    match operation().await {
      Ok(val) => {
        if attempts > 0 {
          info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
        }
        return Ok(val);
      }
      Err(err) => {
        attempts += 1;

        if !err.is_retryable() || attempts >= config.max_attempts {
          return Err(err);
        }

        warn!(
          "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
          operation_name, attempts, config.max_attempts, err, delay
        );

        sleep(delay).await;
        delay = std::cmp::min(delay.mul_f64(config.factor), config.max_delay);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn fast() -> RetryConfig {
    RetryConfig {
      max_attempts: 3,
      initial_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(5),
      factor: 2.0,
    }
  }

  #[tokio::test]
  async fn test_retry_recovers_from_transient_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<u32, RemoteError> = retry("list", &fast(), || {
      let counter = counter.clone();
      async move {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
          Err(RemoteError::Network("connection reset".into()))
        } else {
          Ok(7)
        }
      }
    })
    .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_retry_stops_on_permanent_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<(), RemoteError> = retry("get", &fast(), || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(RemoteError::Forbidden("wh-2".into())) }
    })
    .await;

    assert!(matches!(result, Err(RemoteError::Forbidden(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_retry_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<(), RemoteError> = retry("list", &fast(), || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(RemoteError::Timeout(Duration::from_secs(30))) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
