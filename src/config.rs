use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{Generation, InterceptPolicy, WorkerSettings, DEFAULT_EXTENSIONS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site origin the manifest paths are resolved against
  pub origin: String,
  /// Name of the current cache generation (bump on every deploy)
  pub generation: String,
  pub manifest: ManifestConfig,
  /// Page served when offline and the request itself is not cached
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// URL suffixes handled by the cache (case-insensitive in config)
  #[serde(
    default = "default_extensions",
    deserialize_with = "deserialize_lowercase_list"
  )]
  pub intercept_extensions: Vec<String>,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
  /// Root-relative paths to pre-cache on install
  pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Cache database location (defaults to $XDG_DATA_HOME/assetcache/cache.db)
  pub path: Option<PathBuf>,
}

fn default_offline_fallback() -> String {
  "/index.html".to_string()
}

fn default_extensions() -> Vec<String> {
  DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./assetcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/assetcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/assetcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("assetcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("assetcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }

    if let Some(bad) = self.manifest.paths.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("manifest path '{}' must start with '/'", bad));
    }

    if !self.offline_fallback.starts_with('/') {
      return Err(eyre!(
        "offline_fallback '{}' must start with '/'",
        self.offline_fallback
      ));
    }

    Ok(())
  }

  fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("Unsupported origin scheme '{}'", other)),
    }
  }

  /// Settings for the worker described by this config.
  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    Ok(WorkerSettings {
      origin: self.origin_url()?,
      generation: Generation::new(self.generation.trim()),
      manifest: self.manifest.paths.clone(),
      offline_fallback: self.offline_fallback.clone(),
      policy: InterceptPolicy::new(&self.intercept_extensions),
    })
  }
}
