//! Network access for the worker.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::{AssetRequest, AssetResponse};

/// How intermediate HTTP caches should be treated for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
  /// Let the network stack decide
  #[default]
  Default,
  /// Bypass any HTTP cache and go to the origin
  Reload,
}

/// Failure to get any response from the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("network request to {url} failed: {reason}")]
pub struct NetworkError {
  pub url: String,
  pub reason: String,
}

impl NetworkError {
  pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reason: reason.into(),
    }
  }
}

/// Capability to perform a network request.
///
/// An HTTP error status is still a response; only transport failures are
/// errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(
    &self,
    request: &AssetRequest,
    mode: CacheMode,
  ) -> std::result::Result<AssetResponse, NetworkError>;
}

/// Fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("assetcache/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(
    &self,
    request: &AssetRequest,
    mode: CacheMode,
  ) -> std::result::Result<AssetResponse, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| NetworkError::new(&request.url, e.to_string()))?;

    let mut builder = self.client.request(method, &request.url);
    if mode == CacheMode::Reload {
      builder = builder.headers(reload_headers());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| NetworkError::new(&request.url, e.to_string()))?;

    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = resp
      .bytes()
      .await
      .map_err(|e| NetworkError::new(&request.url, e.to_string()))?;

    Ok(AssetResponse {
      status,
      headers,
      body,
    })
  }
}

fn reload_headers() -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
  headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
  headers
}

/// Resolve a root-relative path (or an absolute URL) against the site origin.
pub fn resolve(origin: &Url, path: &str) -> Result<String> {
  origin
    .join(path)
    .map(String::from)
    .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
}

#[cfg(test)]
pub mod testing {
  //! Scripted network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  pub struct MockNetwork {
    routes: Mutex<HashMap<String, AssetResponse>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    modes: Mutex<Vec<(String, CacheMode)>>,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn route(self, url: &str, response: AssetResponse) -> Self {
      self.set_route(url, response);
      self
    }

    pub fn set_route(&self, url: &str, response: AssetResponse) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<(String, CacheMode)> {
      self.modes.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Fetcher for MockNetwork {
    async fn fetch(
      &self,
      request: &AssetRequest,
      mode: CacheMode,
    ) -> std::result::Result<AssetResponse, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self
        .modes
        .lock()
        .unwrap()
        .push((request.url.clone(), mode));

      if self.offline.load(Ordering::SeqCst) {
        return Err(NetworkError::new(&request.url, "offline"));
      }

      // Unknown routes behave like an origin that answers 404.
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(&request.url)
          .cloned()
          .unwrap_or_else(|| AssetResponse::new(404, "not found")),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_root_relative_path() {
    let origin = Url::parse("https://autoworks.example").unwrap();
    assert_eq!(
      resolve(&origin, "/css/style.css").unwrap(),
      "https://autoworks.example/css/style.css"
    );
    assert_eq!(resolve(&origin, "/").unwrap(), "https://autoworks.example/");
  }

  #[test]
  fn test_resolve_keeps_absolute_url() {
    let origin = Url::parse("https://autoworks.example").unwrap();
    assert_eq!(
      resolve(&origin, "https://cdn.example/app.js").unwrap(),
      "https://cdn.example/app.js"
    );
  }

  #[test]
  fn test_reload_headers_bypass_caches() {
    let headers = reload_headers();
    assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
    assert_eq!(headers.get(PRAGMA).unwrap(), "no-cache");
  }

  #[test]
  fn test_network_error_message() {
    let err = NetworkError::new("https://autoworks.example/", "connection refused");
    assert_eq!(
      err.to_string(),
      "network request to https://autoworks.example/ failed: connection refused"
    );
  }
}
