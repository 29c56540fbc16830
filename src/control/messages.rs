//! Command protocol between the UI side and the worker.
//!
//! On the wire every message is a `{type, data}` envelope; `data` is omitted for
//! messages that carry nothing.

use serde::{Deserialize, Serialize};

use crate::processor::SyncOutcome;

/// Requests the UI can make of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  /// Promote a newly installed worker immediately
  SkipWaiting,
  GetCacheStatus,
  ClearCache,
  SyncQueue,
}

impl Command {
  pub fn from_json(input: &str) -> serde_json::Result<Self> {
    serde_json::from_str(input)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
  pub cache_name: String,
  pub cached_items: u64,
  /// Most recent cache write, ms since epoch
  pub last_update: Option<i64>,
}

/// Answers sent back to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
  CacheStatus(CacheStatus),
  CacheCleared,
  SyncResults(Vec<SyncOutcome>),
  CacheError(String),
  SyncError(String),
}

impl Reply {
  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}
