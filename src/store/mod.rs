//! Local persistent store for offline operation.
//!
//! Three tables back the engine:
//! - offline mutation records (domain-level pending writes)
//! - the sync queue (raw requests to replay, linked to mutation records)
//! - the response cache (namespaced, with per-entry TTL)

mod records;
pub mod schema;
mod sqlite;

pub use records::{
  CacheEntry, FailureRecord, MutationAction, NewQueueEntry, OfflineMutationRecord, ResourceType,
  StoreStats, StoredResponse, SyncQueueEntry,
};
pub use sqlite::Store;

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
