//! Worker lifecycle: install (precache), waiting, active.
//!
//! Cache namespaces carry the configured cache version, so activating a new
//! version drops everything cached by older ones.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::error::{Result, SyncError};
use crate::http::{Destination, Request, Transport};
use crate::store::Store;

/// Versioned cache namespaces, one per request category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  /// Prefix and version, e.g. `rancho-v3`
  pub label: String,
  pub pages: String,
  pub api: String,
  pub assets: String,
  pub runtime: String,
}

impl CacheNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      label: format!("{}-{}", prefix, version),
      pages: format!("{}-pages-{}", prefix, version),
      api: format!("{}-api-{}", prefix, version),
      assets: format!("{}-static-{}", prefix, version),
      runtime: format!("{}-runtime-{}", prefix, version),
    }
  }

  pub fn all(&self) -> [&str; 4] {
    [&self.pages, &self.api, &self.assets, &self.runtime]
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, nothing precached yet
  Parsed,
  /// Installed and waiting for activation
  Waiting,
  Active,
}

pub struct Lifecycle {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  names: CacheNames,
  base_url: Url,
  precache: Vec<String>,
  asset_ttl: Duration,
  state: Mutex<WorkerState>,
}

impl Lifecycle {
  pub fn new(
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    names: CacheNames,
    base_url: Url,
    precache: Vec<String>,
    asset_ttl: Duration,
  ) -> Self {
    Self {
      store,
      transport,
      names,
      base_url,
      precache,
      asset_ttl,
      state: Mutex::new(WorkerState::Parsed),
    }
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Parsed)
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    let mut guard = self
      .state
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;
    *guard = state;
    Ok(())
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  /// Precache the configured assets. Assets that cannot be fetched are skipped.
  /// Returns how many were cached.
  pub async fn install(&self) -> Result<usize> {
    let mut cached = 0;
    for path in &self.precache {
      let url = match self.base_url.join(path) {
        Ok(url) => url,
        Err(e) => {
          warn!(path = %path, error = %e, "skipping invalid precache path");
          continue;
        }
      };

      let request = Request::get(url).with_destination(Destination::from_path(path));
      match self.transport.send(&request).await {
        Ok(response) if response.is_success() => {
          self.store.cache_put(
            &self.names.assets,
            request.url.as_str(),
            &response.to_stored(),
            self.asset_ttl,
          )?;
          cached += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "precache fetch rejected");
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "precache fetch failed");
        }
      }
    }

    self.set_state(WorkerState::Waiting)?;
    info!(cached, total = self.precache.len(), "worker installed");
    Ok(cached)
  }

  /// Drop caches from other versions and take over.
  pub fn activate(&self) -> Result<usize> {
    let removed = self.store.delete_cache_namespaces_except(&self.names.all())?;
    self.set_state(WorkerState::Active)?;
    info!(removed, "worker activated");
    Ok(removed)
  }

  /// Activate immediately without waiting for older workers to go away.
  pub fn skip_waiting(&self) -> Result<()> {
    if self.state() != WorkerState::Active {
      self.activate()?;
    }
    Ok(())
  }
}
