//! The offline asset cache worker: lifecycle plus cache-first serving.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::intercept::InterceptPolicy;
use super::storage::CacheStorage;
use super::types::{AssetRequest, AssetResponse, Generation, RequestKey, ServeSource, Served};
use crate::clients::ClientRegistry;
use crate::network::{resolve, CacheMode, Fetcher, NetworkError};

/// Everything a worker needs to know about the site it serves.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub generation: Generation,
  /// Root-relative paths to pre-cache on install
  pub manifest: Vec<String>,
  /// Document served when the network is down and nothing else is cached
  pub offline_fallback: String,
  pub policy: InterceptPolicy,
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, not installed yet
  Parsed,
  Installing,
  /// Installed, about to activate
  Waiting,
  Activating,
  /// Serving requests
  Active,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
    };
    f.write_str(s)
  }
}

/// Result of pre-caching the manifest.
#[derive(Debug, Default, Clone)]
pub struct InstallReport {
  /// URLs stored in the current generation
  pub stored: Vec<String>,
  /// URLs that could not be stored, with the reason
  pub failed: Vec<(String, String)>,
}

/// Result of an activation.
#[derive(Debug, Default, Clone)]
pub struct ActivateReport {
  /// Stale generations removed from storage
  pub purged: Vec<Generation>,
  /// Pages now controlled by this worker
  pub claimed: usize,
}

/// What the worker did with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not handled; the caller should use plain networking
  Passthrough,
  /// Answered by the worker
  Served(Served),
}

/// Client-side cache for a site's pages and static assets.
///
/// Storage, network and page clients are injected so the worker can run
/// against SQLite and reqwest in the binary and against in-memory doubles
/// in tests.
pub struct OfflineAssetCache<S: CacheStorage + 'static, F: Fetcher + 'static> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  clients: Arc<ClientRegistry>,
  generation: Generation,
  /// Absolute manifest URLs
  manifest: Vec<String>,
  fallback_url: String,
  policy: InterceptPolicy,
  state: WorkerState,
  /// Background cache writes started while serving
  pending_writes: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage + 'static, F: Fetcher + 'static> OfflineAssetCache<S, F> {
  pub fn new(
    settings: WorkerSettings,
    storage: Arc<S>,
    fetcher: Arc<F>,
    clients: Arc<ClientRegistry>,
  ) -> Result<Self> {
    let manifest = settings
      .manifest
      .iter()
      .map(|path| resolve(&settings.origin, path))
      .collect::<Result<Vec<_>>>()?;
    let fallback_url = resolve(&settings.origin, &settings.offline_fallback)?;

    Ok(Self {
      storage,
      fetcher,
      clients,
      generation: settings.generation,
      manifest,
      fallback_url,
      policy: settings.policy,
      state: WorkerState::Parsed,
      pending_writes: Mutex::new(JoinSet::new()),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  fn transition(&mut self, next: WorkerState) {
    debug!(generation = %self.generation, from = %self.state, to = %next, "worker transition");
    self.state = next;
  }

  /// Bring the worker to `Active`.
  ///
  /// If the current generation already exists in storage, a previous run
  /// installed it, so the worker skips the network and only re-runs
  /// activation (which purges anything an interrupted run left behind).
  /// Otherwise it installs and activates.
  pub async fn start(&mut self) -> Result<Option<(InstallReport, ActivateReport)>> {
    if self.storage.generations()?.contains(&self.generation) {
      info!(generation = %self.generation, "resuming installed generation");
      self.transition(WorkerState::Waiting);
      self.activate()?;
      return Ok(None);
    }

    self.install_and_activate().await.map(Some)
  }

  /// Install, then activate without waiting for older workers.
  pub async fn install_and_activate(&mut self) -> Result<(InstallReport, ActivateReport)> {
    let installed = self.install().await?;
    // Skip waiting: activate right away.
    let activated = self.activate()?;
    Ok((installed, activated))
  }

  /// Pre-cache every manifest URL into the current generation.
  ///
  /// Each asset is fetched bypassing HTTP caches. Failures are per asset and
  /// never abort the install.
  pub async fn install(&mut self) -> Result<InstallReport> {
    self.transition(WorkerState::Installing);
    self.storage.open(&self.generation)?;

    let results = join_all(self.manifest.iter().map(|url| self.precache(url))).await;

    let mut report = InstallReport::default();
    for (url, result) in self.manifest.iter().zip(results) {
      match result {
        Ok(()) => report.stored.push(url.clone()),
        Err(reason) => {
          warn!(%url, %reason, "failed to pre-cache asset");
          report.failed.push((url.clone(), reason));
        }
      }
    }

    info!(
      generation = %self.generation,
      stored = report.stored.len(),
      failed = report.failed.len(),
      "installed"
    );
    self.transition(WorkerState::Waiting);
    Ok(report)
  }

  async fn precache(&self, url: &str) -> std::result::Result<(), String> {
    let request = AssetRequest::get(url);
    let response = self
      .fetcher
      .fetch(&request, CacheMode::Reload)
      .await
      .map_err(|e| e.reason)?;

    if !response.is_success() {
      return Err(format!("HTTP {}", response.status));
    }

    self
      .storage
      .put(&self.generation, &request.key(), &response)
      .map_err(|e| e.to_string())
  }

  /// Purge every stale generation, then take control of all pages.
  pub fn activate(&mut self) -> Result<ActivateReport> {
    if self.state != WorkerState::Waiting {
      return Err(eyre!(
        "Cannot activate generation {} from state {}",
        self.generation,
        self.state
      ));
    }
    self.transition(WorkerState::Activating);

    let generations = match self.storage.generations() {
      Ok(generations) => generations,
      Err(e) => {
        self.transition(WorkerState::Waiting);
        return Err(e);
      }
    };

    let mut report = ActivateReport::default();
    for generation in generations {
      if generation == self.generation {
        continue;
      }
      match self.storage.delete(&generation) {
        Ok(_) => {
          info!(%generation, "purged stale generation");
          report.purged.push(generation);
        }
        Err(e) => warn!(%generation, error = %e, "failed to purge stale generation"),
      }
    }

    // Pages are claimed only once every stale bucket is gone.
    report.claimed = self.clients.claim(&self.generation)?;

    info!(generation = %self.generation, claimed = report.claimed, "activated");
    self.transition(WorkerState::Active);
    Ok(report)
  }

  /// Handle a request from a page.
  ///
  /// Cache-first: a hit is returned without touching the network. A miss is
  /// fetched and written back in the background. If the network fails, the
  /// exact request and then the offline fallback document are tried before
  /// the error reaches the caller.
  pub async fn handle_fetch(
    &self,
    request: &AssetRequest,
  ) -> std::result::Result<FetchOutcome, NetworkError> {
    if self.state != WorkerState::Active || !self.policy.intercepts(request) {
      return Ok(FetchOutcome::Passthrough);
    }

    let key = request.key();
    if let Some(served) = self.lookup(&key, ServeSource::Cache) {
      debug!(url = %request.url, "cache hit");
      return Ok(FetchOutcome::Served(served));
    }

    debug!(url = %request.url, "cache miss");
    match self.fetcher.fetch(request, CacheMode::Default).await {
      Ok(response) => {
        self.write_back(key, response.clone()).await;
        Ok(FetchOutcome::Served(Served::from_network(response)))
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "network failed, trying cache");
        if let Some(served) = self.lookup(&key, ServeSource::CacheAfterNetworkError) {
          return Ok(FetchOutcome::Served(served));
        }
        let fallback = RequestKey::get(self.fallback_url.as_str());
        if let Some(served) = self.lookup(&fallback, ServeSource::OfflineFallback) {
          return Ok(FetchOutcome::Served(served));
        }
        Err(err)
      }
    }
  }

  /// Lookup that treats storage errors as a miss.
  fn lookup(&self, key: &RequestKey, source: ServeSource) -> Option<Served> {
    match self.storage.lookup(&self.generation, key) {
      Ok(entry) => entry.map(|e| Served::from_cache(e, source)),
      Err(e) => {
        warn!(url = %key.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  async fn write_back(&self, key: RequestKey, response: AssetResponse) {
    let storage = Arc::clone(&self.storage);
    let generation = self.generation.clone();

    let mut pending = self.pending_writes.lock().await;
    // Drop finished writes so the set only holds in-flight ones.
    while let Some(result) = pending.try_join_next() {
      log_write_result(result);
    }
    pending.spawn_blocking(move || {
      if let Err(e) = storage.put(&generation, &key, &response) {
        warn!(url = %key.url, error = %e, "failed to cache response");
      }
    });
  }

  /// Wait for all background cache writes started so far to finish.
  pub async fn settle(&self) {
    let mut pending = std::mem::take(&mut *self.pending_writes.lock().await);
    while let Some(result) = pending.join_next().await {
      log_write_result(result);
    }
  }
}

fn log_write_result(result: std::result::Result<(), tokio::task::JoinError>) {
  if let Err(e) = result {
    warn!(error = %e, "cache write task failed");
  }
}
