//! Explicit wiring of the sync engine's parts.
//!
//! One `Engine` owns the store, the transport, and everything built on them.
//! Nothing is global; hosts construct it and keep it alive for as long as
//! requests should be intercepted.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::control::{ConnectivityMonitor, ControlHandle, ControlService, MonitorHandle};
use crate::dispatcher::{capture_request, DispatchSettings, Dispatcher, QueuedMutation};
use crate::error::{Result, SyncError};
use crate::http::{Request, Response, Transport};
use crate::lifecycle::Lifecycle;
use crate::processor::{SyncOutcome, SyncProcessor};
use crate::store::{MutationAction, ResourceType, Store};

#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub dispatch: DispatchSettings,
  /// Failures before an entry is dead-lettered; 0 retries forever
  pub max_retries: u32,
  /// Static paths cached at install time
  pub precache: Vec<String>,
  pub grace_period: Duration,
  pub poll_interval: Duration,
  pub command_timeout: Duration,
}

/// Counts removed by a garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
  pub synced_mutations: usize,
  pub expired_cache_entries: usize,
}

pub struct Engine {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  dispatcher: Dispatcher,
  processor: Arc<SyncProcessor>,
  lifecycle: Arc<Lifecycle>,
  service: Arc<ControlService>,
  options: EngineOptions,
}

impl Engine {
  pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, options: EngineOptions) -> Self {
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&transport), &options.dispatch);
    let processor = Arc::new(SyncProcessor::new(
      Arc::clone(&store),
      Arc::clone(&transport),
      options.max_retries,
    ));
    let lifecycle = Arc::new(Lifecycle::new(
      Arc::clone(&store),
      Arc::clone(&transport),
      options.dispatch.cache_names.clone(),
      options.dispatch.app_url.clone(),
      options.precache.clone(),
      options.dispatch.asset_ttl,
    ));
    let service = Arc::new(ControlService::new(
      Arc::clone(&store),
      Arc::clone(&processor),
      Arc::clone(&lifecycle),
    ));

    Self {
      store,
      transport,
      dispatcher,
      processor,
      lifecycle,
      service,
      options,
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn lifecycle(&self) -> &Lifecycle {
    &self.lifecycle
  }

  pub fn service(&self) -> &Arc<ControlService> {
    &self.service
  }

  /// Intercept one request.
  pub async fn fetch(&self, request: Request) -> Response {
    self.dispatcher.dispatch(request).await
  }

  /// Record a write made while offline so it is replayed later.
  ///
  /// `id` addresses an existing item for updates and deletes. Store failures
  /// are returned to the caller.
  pub fn save_offline(
    &self,
    resource: ResourceType,
    action: MutationAction,
    payload: &Value,
    id: Option<&str>,
  ) -> Result<QueuedMutation> {
    let path = format!("{}/{}", self.dispatcher.api_prefix(), resource.endpoint());
    let mut url = self.options.dispatch.app_url.join(&path)?;
    if let Some(id) = id {
      // Pushed as one segment so slashes and dots in the id are escaped
      url
        .path_segments_mut()
        .map_err(|_| SyncError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .push(id);
    }

    let mut request = Request::new(action.method(), url);
    if action != MutationAction::Delete {
      request = request
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(payload)?);
    }

    let queued = capture_request(&self.store, self.dispatcher.api_prefix(), &request)?;
    info!(
      resource = %resource,
      action = action.as_str(),
      queue_id = queued.queue_id,
      "saved mutation offline"
    );
    Ok(queued)
  }

  /// Replay the queue now, updating the published status.
  pub async fn sync(&self) -> Result<Vec<SyncOutcome>> {
    self.service.sync().await
  }

  pub fn is_syncing(&self) -> bool {
    self.processor.is_syncing()
  }

  /// Precache static assets, then activate this cache version.
  pub async fn install_and_activate(&self) -> Result<usize> {
    let cached = self.lifecycle.install().await?;
    self.lifecycle.activate()?;
    Ok(cached)
  }

  /// Start serving control commands.
  pub fn start_control(&self) -> ControlHandle {
    Arc::clone(&self.service).spawn(self.options.command_timeout)
  }

  /// Start watching connectivity; reconnection triggers a sync.
  pub fn start_monitor(&self) -> MonitorHandle {
    ConnectivityMonitor::new(
      Arc::clone(&self.service),
      Arc::clone(&self.transport),
      self.options.poll_interval,
      self.options.grace_period,
    )
    .spawn()
  }

  /// Drop synced mutation records and expired cache entries.
  pub fn collect_garbage(&self) -> Result<GcReport> {
    let report = GcReport {
      synced_mutations: self.store.delete_synced_mutations()?,
      expired_cache_entries: self.store.evict_expired_cache()?,
    };
    info!(
      synced = report.synced_mutations,
      expired = report.expired_cache_entries,
      "garbage collected"
    );
    Ok(report)
  }
}
