//! Worker side of the control channel and the handle the UI side talks through.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::messages::{CacheStatus, Command, Reply};
use super::status::{ConnectionStatus, SyncStatus};
use crate::error::{Result, SyncError};
use crate::lifecycle::Lifecycle;
use crate::processor::{SyncOutcome, SyncProcessor};
use crate::store::{Store, StoreStats};

type Envelope = (Command, oneshot::Sender<Option<Reply>>);

/// Executes control commands and owns the published connection status.
pub struct ControlService {
  store: Arc<Store>,
  processor: Arc<SyncProcessor>,
  lifecycle: Arc<Lifecycle>,
  status: watch::Sender<ConnectionStatus>,
}

impl ControlService {
  pub fn new(store: Arc<Store>, processor: Arc<SyncProcessor>, lifecycle: Arc<Lifecycle>) -> Self {
    let (status, _) = watch::channel(ConnectionStatus::default());
    Self {
      store,
      processor,
      lifecycle,
      status,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
    self.status.subscribe()
  }

  pub fn status(&self) -> ConnectionStatus {
    self.status.borrow().clone()
  }

  pub(crate) fn update_status<F>(&self, f: F)
  where
    F: FnOnce(&mut ConnectionStatus),
  {
    self.status.send_modify(f);
  }

  /// Run one command to completion. `SKIP_WAITING` has no reply.
  pub async fn handle(&self, command: Command) -> Option<Reply> {
    debug!(?command, "handling control command");
    match command {
      Command::SkipWaiting => {
        if let Err(e) = self.lifecycle.skip_waiting() {
          warn!(error = %e, "skip waiting failed");
        }
        None
      }
      Command::GetCacheStatus => Some(match self.cache_status() {
        Ok(status) => Reply::CacheStatus(status),
        Err(e) => Reply::CacheError(e.to_string()),
      }),
      Command::ClearCache => Some(match self.store.clear_cache() {
        Ok(removed) => {
          debug!(removed, "cache cleared");
          Reply::CacheCleared
        }
        Err(e) => Reply::CacheError(e.to_string()),
      }),
      Command::SyncQueue => Some(match self.sync().await {
        Ok(outcomes) => Reply::SyncResults(outcomes),
        Err(e) => Reply::SyncError(e.to_string()),
      }),
    }
  }

  pub fn cache_status(&self) -> Result<CacheStatus> {
    let stats = self.store.stats()?;
    Ok(CacheStatus {
      cache_name: self.lifecycle.names().label.clone(),
      cached_items: stats.cache_entries,
      last_update: stats.last_cache_write,
    })
  }

  /// Run the processor, keeping `sync_status` and `pending_count` current.
  /// Any processor error leaves the status at `error`, never at `syncing`.
  pub async fn sync(&self) -> Result<Vec<SyncOutcome>> {
    if self.processor.is_syncing() {
      return Err(SyncError::SyncInProgress);
    }

    self.update_status(|s| s.sync_status = SyncStatus::Syncing);
    let result = self.processor.run().await;

    match &result {
      // Another run owns the status and will settle it
      Err(SyncError::SyncInProgress) => {}
      Ok(_) => self.update_status(|s| s.sync_status = SyncStatus::Idle),
      Err(e) => {
        warn!(error = %e, "sync run failed");
        self.update_status(|s| s.sync_status = SyncStatus::Error);
      }
    }

    if let Err(e) = self.refresh_counts() {
      warn!(error = %e, "failed to refresh pending count");
    }
    result
  }

  /// Re-read store statistics into the published status.
  pub fn refresh_counts(&self) -> Result<StoreStats> {
    let stats = self.store.stats()?;
    let pending = stats.pending();
    self.update_status(|s| s.pending_count = pending);
    Ok(stats)
  }

  /// Serve commands on a background task until every handle is dropped.
  /// Each command runs on its own task so a long sync does not hold up status queries.
  pub fn spawn(self: Arc<Self>, command_timeout: Duration) -> ControlHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(32);
    let status = self.subscribe();

    tokio::spawn(async move {
      while let Some((command, reply_tx)) = rx.recv().await {
        let service = Arc::clone(&self);
        tokio::spawn(async move {
          let reply = service.handle(command).await;
          // The caller may have given up waiting
          let _ = reply_tx.send(reply);
        });
      }
      debug!("control channel closed");
    });

    ControlHandle::new(tx, status, command_timeout)
  }
}

/// UI-side endpoint of the control channel. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::Sender<Envelope>,
  status: watch::Receiver<ConnectionStatus>,
  timeout: Duration,
}

impl ControlHandle {
  fn new(
    tx: mpsc::Sender<Envelope>,
    status: watch::Receiver<ConnectionStatus>,
    timeout: Duration,
  ) -> Self {
    Self {
      tx,
      status,
      timeout,
    }
  }

  /// Round-trip a command and return the raw reply, error replies included.
  pub async fn send(&self, command: Command) -> Result<Option<Reply>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send((command, reply_tx))
      .await
      .map_err(|_| SyncError::ControlChannel("worker is not running".into()))?;

    match tokio::time::timeout(self.timeout, reply_rx).await {
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(SyncError::ControlChannel(
        "worker dropped the request".into(),
      )),
      Err(_) => Err(SyncError::ControlChannel(format!(
        "no reply to {:?} within {:?}",
        command, self.timeout
      ))),
    }
  }

  /// Like `send`, but error replies come back as `Err`.
  pub async fn request(&self, command: Command) -> Result<Option<Reply>> {
    match self.send(command).await? {
      Some(Reply::CacheError(message)) => Err(SyncError::CommandFailed {
        kind: "CACHE_ERROR",
        message,
      }),
      Some(Reply::SyncError(message)) => Err(SyncError::CommandFailed {
        kind: "SYNC_ERROR",
        message,
      }),
      reply => Ok(reply),
    }
  }

  pub async fn skip_waiting(&self) -> Result<()> {
    self.request(Command::SkipWaiting).await.map(|_| ())
  }

  pub async fn cache_status(&self) -> Result<CacheStatus> {
    match self.request(Command::GetCacheStatus).await? {
      Some(Reply::CacheStatus(status)) => Ok(status),
      other => Err(unexpected(Command::GetCacheStatus, other)),
    }
  }

  pub async fn clear_cache(&self) -> Result<()> {
    match self.request(Command::ClearCache).await? {
      Some(Reply::CacheCleared) => Ok(()),
      other => Err(unexpected(Command::ClearCache, other)),
    }
  }

  pub async fn sync_queue(&self) -> Result<Vec<SyncOutcome>> {
    match self.request(Command::SyncQueue).await? {
      Some(Reply::SyncResults(outcomes)) => Ok(outcomes),
      other => Err(unexpected(Command::SyncQueue, other)),
    }
  }

  /// Latest published status.
  pub fn status(&self) -> ConnectionStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
    self.status.clone()
  }
}

fn unexpected(command: Command, reply: Option<Reply>) -> SyncError {
  SyncError::ControlChannel(format!("unexpected reply to {:?}: {:?}", command, reply))
}
