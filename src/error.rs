//! Error taxonomy for the sync engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
  /// The local store could not be opened or created.
  #[error("local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A store operation failed on an open store.
  #[error("storage operation failed: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Transient network failure. Never surfaced from the dispatcher.
  #[error("network failure: {0}")]
  NetworkFailure(String),

  /// Reissuing a specific queue entry failed.
  #[error("replay of queue entry {id} failed: {reason}")]
  ReplayFailure { id: i64, reason: String },

  /// A control message round-trip failed or timed out.
  #[error("control channel error: {0}")]
  ControlChannel(String),

  /// A command reached the worker but the worker reported an error.
  #[error("{kind}: {message}")]
  CommandFailed { kind: &'static str, message: String },

  #[error("a sync run is already in progress")]
  SyncInProgress,

  #[error("invalid URL: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
}

impl SyncError {
  /// Whether retrying later could succeed without intervention.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SyncError::NetworkFailure(_) | SyncError::ReplayFailure { .. } | SyncError::SyncInProgress
    )
  }
}
