mod app;
mod cache;
mod clients;
mod config;
mod network;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::app::{Action, App};
use crate::cache::{MemoryStorage, SqliteStorage};

#[derive(Parser, Debug)]
#[command(name = "assetcache")]
#[command(about = "Offline-first cache for a static site's pages and assets")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/assetcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep the cache in memory instead of the on-disk database
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the manifest and activate the configured generation
  Install,
  /// Request a path through the cache and print the body
  Get {
    /// Root-relative path, e.g. /about.html
    path: String,
    /// Treat the request as a top-level page load
    #[arg(long)]
    navigate: bool,
  },
  /// List cache generations in storage
  Generations,
}

impl From<Command> for Action {
  fn from(command: Command) -> Self {
    match command {
      Command::Install => Action::Install,
      Command::Get { path, navigate } => Action::Get { path, navigate },
      Command::Generations => Action::Generations,
    }
  }
}

/// Log to stderr, filtered by ASSETCACHE_LOG (default: info).
fn init_logging() -> WorkerGuard {
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
  let filter =
    EnvFilter::try_from_env("ASSETCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_target(false)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging();

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let settings = config.worker_settings()?;
  let action = Action::from(args.command);

  if args.ephemeral {
    App::new(settings, MemoryStorage::new())?.run(action).await
  } else {
    let path = match &config.storage.path {
      Some(p) => p.clone(),
      None => SqliteStorage::default_path()?,
    };
    App::new(settings, SqliteStorage::open_at(&path)?)?
      .run(action)
      .await
  }
}
