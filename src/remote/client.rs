//! HTTP remote store client.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::{RemoteError, RemoteStore, WriteAck};
use crate::config::{Config, RemoteConfig};
use crate::sync::{Record, Scope};

/// Remote inventory API client.
///
/// Scoped endpoints live under `scopes/{scope}/products`. A `404` on a scoped
/// endpoint falls back to the unscoped `products` endpoint so older backends
/// keep working.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody {
  Bare(Vec<Record>),
  Page { items: Vec<Record> },
}

impl ListBody {
  fn into_records(self) -> Vec<Record> {
    match self {
      ListBody::Bare(records) => records,
      ListBody::Page { items } => items,
    }
  }
}

enum Endpoint<'a> {
  Collection,
  Item(&'a str),
}

impl HttpRemoteStore {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let raw = config
      .url
      .as_deref()
      .ok_or_else(|| eyre!("remote.url is not configured"))?;

    let mut base = Url::parse(raw).map_err(|e| eyre!("Invalid remote url {}: {}", raw, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Remote url {} cannot be used as a base", raw));
    }
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let timeout = Duration::from_secs(config.timeout_secs);
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token: Config::get_api_token(),
      timeout,
    })
  }

  fn url(&self, scope: Option<&Scope>, endpoint: &Endpoint<'_>) -> Result<Url, RemoteError> {
    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| RemoteError::Validation(format!("invalid base url {}", self.base)))?;
      segments.pop_if_empty();
      if let Some(scope) = scope {
        segments.extend(["scopes", scope.as_str()]);
      }
      segments.push("products");
      if let Endpoint::Item(identity) = endpoint {
        segments.push(identity);
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder, identity: &str) -> Result<Vec<u8>, RemoteError> {
    let response = builder.send().await.map_err(|e| self.transport_error(e))?;
    let status = response.status();
    let body = response
      .bytes()
      .await
      .map_err(|e| self.transport_error(e))?;

    if status.is_success() {
      return Ok(body.to_vec());
    }

    let text = String::from_utf8_lossy(&body).into_owned();
    Err(RemoteError::from_status(status.as_u16(), identity, text))
  }

  fn transport_error(&self, err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
      RemoteError::Timeout(self.timeout)
    } else {
      RemoteError::Network(err.to_string())
    }
  }

  /// Issue a request against the scoped endpoint, retrying once against the
  /// legacy endpoint when the scoped one answers `404`.
  async fn scoped<F>(
    &self,
    scope: &Scope,
    endpoint: Endpoint<'_>,
    identity: &str,
    build: F,
  ) -> Result<Vec<u8>, RemoteError>
  where
    F: Fn(Url) -> RequestBuilder,
  {
    let scoped_url = self.url(Some(scope), &endpoint)?;
    match self.send(build(scoped_url), identity).await {
      Err(RemoteError::NotFound(_)) => {
        debug!(scope = %scope, identity, "scoped endpoint returned 404, trying legacy endpoint");
        let legacy_url = self.url(None, &endpoint)?;
        self.send(build(legacy_url), identity).await
      }
      other => other,
    }
  }

  /// A body counts as the authoritative record only when it carries the
  /// server's bookkeeping. Anything else is a bare acknowledgement.
  fn parse_ack(body: &[u8]) -> WriteAck {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
      return WriteAck::Acknowledged;
    };
    let authoritative = value.get("id").is_some_and(|v| v.is_string())
      && value.get("version").is_some_and(|v| v.is_u64())
      && value.get("updatedAt").is_some_and(|v| v.is_string());
    if !authoritative {
      return WriteAck::Acknowledged;
    }
    match serde_json::from_value::<Record>(value) {
      Ok(record) => WriteAck::Record(record),
      Err(e) => {
        debug!(error = %e, "write response is not a record, treating as acknowledgement");
        WriteAck::Acknowledged
      }
    }
  }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn list(&self, scope: &Scope, limit: usize) -> Result<Vec<Record>, RemoteError> {
    let limit = limit.to_string();
    let body = self
      .scoped(scope, Endpoint::Collection, "", |mut url| {
        url.query_pairs_mut().append_pair("limit", &limit);
        self.request(Method::GET, url)
      })
      .await?;

    let parsed: ListBody = serde_json::from_slice(&body)
      .map_err(|e| RemoteError::Validation(format!("malformed product list: {}", e)))?;
    Ok(parsed.into_records())
  }

  async fn get(&self, scope: &Scope, identity: &str) -> Result<Option<Record>, RemoteError> {
    let body = match self
      .scoped(scope, Endpoint::Item(identity), identity, |url| {
        self.request(Method::GET, url)
      })
      .await
    {
      Ok(body) => body,
      Err(RemoteError::NotFound(_)) => return Ok(None),
      Err(e) => return Err(e),
    };

    serde_json::from_slice(&body)
      .map(Some)
      .map_err(|e| RemoteError::Validation(format!("malformed product {}: {}", identity, e)))
  }

  async fn create(
    &self,
    scope: &Scope,
    record: &Record,
    idempotency_token: &str,
  ) -> Result<WriteAck, RemoteError> {
    let body = self
      .scoped(scope, Endpoint::Collection, &record.id, |url| {
        self
          .request(Method::POST, url)
          .header("Idempotency-Key", idempotency_token)
          .json(record)
      })
      .await?;
    Ok(Self::parse_ack(&body))
  }

  async fn update(
    &self,
    scope: &Scope,
    record: &Record,
    known_version: Option<u64>,
  ) -> Result<WriteAck, RemoteError> {
    let mut payload = record.clone();
    payload.version = known_version;

    let result = self
      .scoped(scope, Endpoint::Item(&record.id), &record.id, |url| {
        let builder = self.request(Method::PUT, url).json(&payload);
        match known_version {
          Some(v) => builder.header("If-Match", v.to_string()),
          None => builder,
        }
      })
      .await;

    match result {
      Ok(body) => Ok(Self::parse_ack(&body)),
      Err(RemoteError::Conflict { identity, .. }) => Err(RemoteError::Conflict {
        identity,
        server_version: None,
      }),
      Err(e) => Err(e),
    }
  }

  async fn delete(&self, scope: &Scope, identity: &str) -> Result<(), RemoteError> {
    self
      .scoped(scope, Endpoint::Item(identity), identity, |url| {
        self.request(Method::DELETE, url)
      })
      .await
      .map(|_| ())
  }

  async fn delete_many(&self, scope: &Scope, identities: &[String]) -> Result<(), RemoteError> {
    let payload = serde_json::json!({ "ids": identities });
    match self
      .scoped(scope, Endpoint::Collection, "", |url| {
        self.request(Method::DELETE, url).json(&payload)
      })
      .await
    {
      Ok(_) => Ok(()),
      Err(RemoteError::Server { status, .. })
        if status == StatusCode::METHOD_NOT_ALLOWED.as_u16() =>
      {
        debug!(scope = %scope, "bulk delete unsupported, deleting one by one");
        for identity in identities {
          match self.delete(scope, identity).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e),
          }
        }
        Ok(())
      }
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store(url: &str) -> HttpRemoteStore {
    HttpRemoteStore::new(&RemoteConfig {
      url: Some(url.into()),
      ..RemoteConfig::default()
    })
    .unwrap()
  }

  #[test]
  fn test_scoped_and_legacy_urls() {
    let store = store("https://pos.example.com/api/v2");
    let scope = Scope::new("wh 1");

    let scoped = store.url(Some(&scope), &Endpoint::Item("p/1")).unwrap();
    assert_eq!(
      scoped.as_str(),
      "https://pos.example.com/api/v2/scopes/wh%201/products/p%2F1"
    );

    let legacy = store.url(None, &Endpoint::Collection).unwrap();
    assert_eq!(legacy.as_str(), "https://pos.example.com/api/v2/products");
  }

  #[test]
  fn test_missing_url_is_a_config_error() {
    assert!(HttpRemoteStore::new(&RemoteConfig::default()).is_err());
  }

  #[test]
  fn test_parse_ack_distinguishes_records_from_acknowledgements() {
    assert_eq!(HttpRemoteStore::parse_ack(b""), WriteAck::Acknowledged);
    assert_eq!(
      HttpRemoteStore::parse_ack(br#"{"status":"accepted"}"#),
      WriteAck::Acknowledged
    );
    match HttpRemoteStore::parse_ack(
      br#"{"id":"p1","version":1,"updatedAt":"2024-05-01T10:00:00Z","qty":5}"#,
    ) {
      WriteAck::Record(r) => {
        assert_eq!(r.version, Some(1));
        assert_eq!(r.field("qty"), Some(&serde_json::json!(5)));
      }
      WriteAck::Acknowledged => panic!("expected record"),
    }
  }

  #[test]
  fn test_parse_ack_needs_server_bookkeeping() {
    assert_eq!(
      HttpRemoteStore::parse_ack(br#"{"id":"p1","ok":true}"#),
      WriteAck::Acknowledged
    );
    assert_eq!(
      HttpRemoteStore::parse_ack(br#"{"id":"p1","version":2,"qty":5}"#),
      WriteAck::Acknowledged
    );
    assert_eq!(
      HttpRemoteStore::parse_ack(br#"{"id":"p1","updatedAt":"2024-05-01T10:00:00Z"}"#),
      WriteAck::Acknowledged
    );
  }
}
