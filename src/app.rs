use color_eyre::Result;
use std::io::Write;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::{
  AssetRequest, CacheStorage, FetchOutcome, OfflineAssetCache, ServeSource, WorkerSettings,
};
use crate::clients::ClientRegistry;
use crate::network::{resolve, CacheMode, Fetcher, HttpFetcher};

/// What the user asked the binary to do
#[derive(Debug, Clone)]
pub enum Action {
  /// Re-fetch the manifest into the current generation and activate it
  Install,
  /// Serve a single path through the cache
  Get { path: String, navigate: bool },
  /// List generations in storage
  Generations,
}

/// Command-line driver around one worker instance.
pub struct App<S: CacheStorage + 'static> {
  origin: Url,
  storage: Arc<S>,
  fetcher: Arc<HttpFetcher>,
  clients: Arc<ClientRegistry>,
  worker: OfflineAssetCache<S, HttpFetcher>,
}

impl<S: CacheStorage + 'static> App<S> {
  pub fn new(settings: WorkerSettings, storage: S) -> Result<Self> {
    let origin = settings.origin.clone();
    let storage = Arc::new(storage);
    let fetcher = Arc::new(HttpFetcher::new()?);
    let clients = Arc::new(ClientRegistry::new());
    let worker = OfflineAssetCache::new(
      settings,
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      Arc::clone(&clients),
    )?;

    Ok(Self {
      origin,
      storage,
      fetcher,
      clients,
      worker,
    })
  }

  pub async fn run(&mut self, action: Action) -> Result<()> {
    match action {
      Action::Install => self.install().await,
      Action::Get { path, navigate } => self.get(&path, navigate).await,
      Action::Generations => self.generations(),
    }
  }

  async fn install(&mut self) -> Result<()> {
    let (installed, activated) = self.worker.install_and_activate().await?;

    for url in &installed.stored {
      println!("cached  {url}");
    }
    for (url, reason) in &installed.failed {
      println!("failed  {url}: {reason}");
    }
    for generation in &activated.purged {
      println!("purged  {generation}");
    }
    println!(
      "generation {} active ({} cached, {} failed)",
      self.worker.generation(),
      installed.stored.len(),
      installed.failed.len()
    );
    Ok(())
  }

  async fn get(&mut self, path: &str, navigate: bool) -> Result<()> {
    // This process is the page issuing the request.
    self.clients.connect()?;
    self.worker.start().await?;
    info!(
      generation = %self.worker.generation(),
      state = %self.worker.state(),
      "worker ready"
    );

    let url = resolve(&self.origin, path)?;
    let request = if navigate {
      AssetRequest::navigate(url)
    } else {
      AssetRequest::get(url)
    };

    let (response, source) = match self.worker.handle_fetch(&request).await? {
      FetchOutcome::Served(served) => {
        if let Some(cached_at) = served.cached_at {
          info!(url = %request.url, %cached_at, "served from cache");
        }
        (served.response, Some(served.source))
      }
      FetchOutcome::Passthrough => {
        info!(url = %request.url, "not intercepted, fetching directly");
        (
          self.fetcher.fetch(&request, CacheMode::Default).await?,
          None,
        )
      }
    };
    self.worker.settle().await;

    eprintln!(
      "{} {} {} ({})",
      response.status,
      request.url,
      response.header("content-type").unwrap_or("-"),
      source.map_or("passthrough".to_string(), |s: ServeSource| s.to_string())
    );
    std::io::stdout().write_all(&response.body)?;
    Ok(())
  }

  fn generations(&self) -> Result<()> {
    let current = self.worker.generation();
    for generation in self.storage.generations()? {
      let marker = if &generation == current { "*" } else { " " };
      println!(
        "{marker} {generation}\t{} entries",
        self.storage.entry_count(&generation)?
      );
    }
    Ok(())
  }
}
