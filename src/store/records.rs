//! Record types persisted by the local store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Domain resources the farm API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
  Livestock,
  FinanceEntry,
  Crop,
  MilkProduction,
  Report,
  SubUser,
}

impl ResourceType {
  pub const ALL: [ResourceType; 6] = [
    ResourceType::Livestock,
    ResourceType::FinanceEntry,
    ResourceType::Crop,
    ResourceType::MilkProduction,
    ResourceType::Report,
    ResourceType::SubUser,
  ];

  /// Path segment of the resource collection on the remote API.
  pub fn endpoint(&self) -> &'static str {
    match self {
      ResourceType::Livestock => "ganado",
      ResourceType::FinanceEntry => "finanzas",
      ResourceType::Crop => "cultivos",
      ResourceType::MilkProduction => "produccion-leche",
      ResourceType::Report => "reportes",
      ResourceType::SubUser => "usuarios",
    }
  }

  /// Stored name, stable across releases.
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Livestock => "livestock",
      ResourceType::FinanceEntry => "finance-entry",
      ResourceType::Crop => "crop",
      ResourceType::MilkProduction => "milk-production",
      ResourceType::Report => "report",
      ResourceType::SubUser => "sub-user",
    }
  }

  /// Resolve the resource addressed by an API path such as `/api/finanzas/12`.
  pub fn from_api_path(path: &str, prefix: &str) -> Option<Self> {
    let rest = path.strip_prefix(prefix)?;
    let segment = rest.trim_start_matches('/').split('/').next()?;
    Self::ALL.into_iter().find(|r| r.endpoint() == segment)
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|r| r.as_str() == s || r.endpoint() == s)
      .ok_or_else(|| format!("unknown resource type '{}'", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
  Create,
  Update,
  Delete,
}

impl MutationAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationAction::Create => "create",
      MutationAction::Update => "update",
      MutationAction::Delete => "delete",
    }
  }

  /// Map an HTTP method onto the mutation it performs.
  pub fn from_method(method: &str) -> Option<Self> {
    match method.to_ascii_uppercase().as_str() {
      "POST" => Some(MutationAction::Create),
      "PUT" | "PATCH" => Some(MutationAction::Update),
      "DELETE" => Some(MutationAction::Delete),
      _ => None,
    }
  }

  pub fn method(&self) -> &'static str {
    match self {
      MutationAction::Create => "POST",
      MutationAction::Update => "PUT",
      MutationAction::Delete => "DELETE",
    }
  }
}

impl FromStr for MutationAction {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(MutationAction::Create),
      "update" => Ok(MutationAction::Update),
      "delete" => Ok(MutationAction::Delete),
      other => Err(format!("unknown mutation action '{}'", other)),
    }
  }
}

/// A domain mutation captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMutationRecord {
  pub id: i64,
  pub resource_type: ResourceType,
  pub payload: serde_json::Value,
  /// Milliseconds since epoch
  pub timestamp: i64,
  pub synced: bool,
  pub action: MutationAction,
}

/// A request waiting to be replayed, as handed to `Store::enqueue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewQueueEntry {
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  /// Mutation record this request replays, if any
  pub mutation_id: Option<i64>,
}

/// A request persisted in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub timestamp: i64,
  pub retries: u32,
  pub mutation_id: Option<i64>,
  pub idempotency_key: String,
  pub last_error: Option<String>,
  pub dead_lettered: bool,
}

/// Outcome of recording a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
  pub retries: u32,
  pub dead_lettered: bool,
}

/// Response payload kept in the cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

/// A cache row with its expiry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub namespace: String,
  pub url: String,
  pub response: StoredResponse,
  pub timestamp: i64,
  pub ttl: i64,
}

impl CacheEntry {
  pub fn is_expired(&self, now: i64) -> bool {
    now - self.timestamp >= self.ttl
  }
}

/// Counts used for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
  pub unsynced_mutations: u64,
  pub queued_entries: u64,
  pub dead_letters: u64,
  pub cache_entries: u64,
  /// Most recent cache write, ms since epoch
  pub last_cache_write: Option<i64>,
}

impl StoreStats {
  /// Operations still waiting on the remote API.
  pub fn pending(&self) -> u64 {
    self.queued_entries
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resource_from_api_path() {
    assert_eq!(
      ResourceType::from_api_path("/api/finanzas", "/api"),
      Some(ResourceType::FinanceEntry)
    );
    assert_eq!(
      ResourceType::from_api_path("/api/produccion-leche/42", "/api"),
      Some(ResourceType::MilkProduction)
    );
    assert_eq!(ResourceType::from_api_path("/api/unknown", "/api"), None);
    assert_eq!(ResourceType::from_api_path("/cultivos", "/api"), None);
  }

  #[test]
  fn test_action_from_method() {
    assert_eq!(MutationAction::from_method("post"), Some(MutationAction::Create));
    assert_eq!(MutationAction::from_method("PATCH"), Some(MutationAction::Update));
    assert_eq!(MutationAction::from_method("DELETE"), Some(MutationAction::Delete));
    assert_eq!(MutationAction::from_method("GET"), None);
  }

  #[test]
  fn test_cache_entry_expiry_is_inclusive() {
    let entry = CacheEntry {
      namespace: "api".into(),
      url: "/api/ganado".into(),
      response: StoredResponse {
        status: 200,
        headers: BTreeMap::new(),
        body: b"[]".to_vec(),
      },
      timestamp: 1_000,
      ttl: 500,
    };
    assert!(!entry.is_expired(1_499));
    assert!(entry.is_expired(1_500));
  }
}
