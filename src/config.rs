use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::dispatcher::DispatchSettings;
use crate::engine::EngineOptions;
use crate::lifecycle::CacheNames;
use crate::store::Store;

/// Prefix shared by every cache namespace.
const CACHE_PREFIX: &str = "rancho";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Offline database (defaults to $XDG_DATA_HOME/rancho/offline.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin of the admin app; API paths are resolved against it
  pub base_url: String,
  #[serde(default = "default_prefix")]
  pub prefix: String,
  #[serde(default = "default_request_timeout")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bumping this drops every cache written under the previous version
  pub version: String,
  pub api_ttl_secs: u64,
  pub static_ttl_secs: u64,
  pub page_ttl_secs: u64,
  /// Static paths fetched at install time
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".into(),
      api_ttl_secs: 5 * 60,
      static_ttl_secs: 7 * 24 * 60 * 60,
      page_ttl_secs: 24 * 60 * 60,
      precache: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// 0 disables dead-lettering
  pub max_retries: u32,
  pub grace_period_ms: u64,
  pub poll_interval_secs: u64,
  pub navigation_timeout_ms: u64,
  pub command_timeout_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      grace_period_ms: 5_000,
      poll_interval_secs: 30,
      navigation_timeout_ms: 3_000,
      command_timeout_ms: 10_000,
    }
  }
}

fn default_prefix() -> String {
  "/api".into()
}

fn default_request_timeout() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rancho.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rancho/config.yaml
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
        "No configuration file found. Create one at ~/.config/rancho/config.yaml\n\
                 See rancho.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rancho.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rancho").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.app_url()?;
    if config.sync.poll_interval_secs == 0 {
      return Err(eyre!("sync.poll_interval_secs must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks RANCHO_API_TOKEN first, then API_TOKEN as fallback. Requests go out
  /// unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RANCHO_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|token| !token.is_empty())
  }

  pub fn app_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", self.api.base_url, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Store::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn cache_names(&self) -> CacheNames {
    CacheNames::new(CACHE_PREFIX, &self.cache.version)
  }

  pub fn engine_options(&self) -> Result<EngineOptions> {
    let sync = &self.sync;
    Ok(EngineOptions {
      dispatch: DispatchSettings {
        app_url: self.app_url()?,
        api_prefix: self.api.prefix.clone(),
        cache_names: self.cache_names(),
        api_ttl: Duration::from_secs(self.cache.api_ttl_secs),
        asset_ttl: Duration::from_secs(self.cache.static_ttl_secs),
        page_ttl: Duration::from_secs(self.cache.page_ttl_secs),
        navigation_timeout: Duration::from_millis(sync.navigation_timeout_ms),
      },
      max_retries: sync.max_retries,
      precache: self.cache.precache.clone(),
      grace_period: Duration::from_millis(sync.grace_period_ms),
      poll_interval: Duration::from_secs(sync.poll_interval_secs),
      command_timeout: Duration::from_millis(sync.command_timeout_ms),
    })
  }
}
