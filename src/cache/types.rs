//! Core types for the asset cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Name of a cache bucket (e.g. "autoworks-pro-v1").
///
/// Exactly one generation is current for a running worker; every other
/// generation found in storage is stale and gets purged on activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  /// Subresource fetch (stylesheet, script, fetch() call, ...)
  #[default]
  Subresource,
}

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
  pub method: String,
  /// Absolute URL
  pub url: String,
  pub mode: RequestMode,
}

impl AssetRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: impl Into<String>) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn key(&self) -> RequestKey {
    RequestKey {
      method: self.method.to_uppercase(),
      url: self.url.clone(),
    }
  }
}

/// Identity of a stored entry within a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
    }
  }

  /// Stable fixed-length hash used as the storage primary key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Snapshot of a response: status, headers and body.
///
/// Cloning shares the body buffer, so a response can be handed to the
/// caller and written to the cache without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl AssetResponse {
  #[cfg(test)]
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response read back from storage.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: AssetResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Hit in the current generation, no network call made
  Cache,
  /// Fetched from network on a miss (and written back to the cache)
  Network,
  /// Network failed, but the exact request showed up in the cache meanwhile
  CacheAfterNetworkError,
  /// Network failed, served the cached home document instead
  OfflineFallback,
}

impl fmt::Display for ServeSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::CacheAfterNetworkError => "cache-after-network-error",
      Self::OfflineFallback => "offline-fallback",
    };
    f.write_str(s)
  }
}

/// A response plus metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: AssetResponse,
  pub source: ServeSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: AssetResponse) -> Self {
    Self {
      response,
      source: ServeSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CachedEntry, source: ServeSource) -> Self {
    Self {
      response: entry.response,
      source,
      cached_at: Some(entry.cached_at),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_uppercases_method() {
    let req = AssetRequest {
      method: "get".to_string(),
      url: "https://example.com/a.css".to_string(),
      mode: RequestMode::Subresource,
    };
    assert_eq!(req.key(), RequestKey::get("https://example.com/a.css"));
  }

  #[test]
  fn test_digest_depends_on_method() {
    let get = RequestKey::get("https://example.com/");
    let head = RequestKey {
      method: "HEAD".to_string(),
      url: "https://example.com/".to_string(),
    };
    assert_ne!(get.digest(), head.digest());
    assert_eq!(get.digest().len(), 64);
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let resp = AssetResponse::new(200, "x").with_header("Content-Type", "text/css");
    assert_eq!(resp.header("content-type"), Some("text/css"));
    assert_eq!(resp.header("etag"), None);
  }
}
