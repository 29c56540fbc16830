//! SQLite implementation of the local store.

use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::records::{
  CacheEntry, FailureRecord, MutationAction, NewQueueEntry, OfflineMutationRecord, ResourceType,
  StoreStats, StoredResponse, SyncQueueEntry,
};
use super::schema::{MIGRATIONS, SCHEMA_VERSION};
use super::now_millis;
use crate::error::{Result, SyncError};

const MUTATION_COLUMNS: &str = "id, resource_type, payload, timestamp, synced, action";
const QUEUE_COLUMNS: &str = "id, url, method, headers, body, timestamp, retries, mutation_id, \
                             idempotency_key, last_error, dead_lettered";

/// Handle to the local store.
///
/// Constructed explicitly and shared through `Arc`; every operation is a short
/// transaction on the guarded connection.
pub struct Store {
  conn: Mutex<Option<Connection>>,
}

impl Store {
  /// Open (creating if needed) the store at `path` and bring the schema up to date.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!(
          "failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!("failed to open store at {}: {}", path.display(), e))
    })?;

    let store = Self::from_connection(conn);
    store.initialize()?;
    info!(path = %path.display(), "opened local store");
    Ok(store)
  }

  /// Open a throwaway store that lives only as long as this handle.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to open in-memory store: {}", e)))?;
    let store = Self::from_connection(conn);
    store.initialize()?;
    Ok(store)
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(Some(conn)),
    }
  }

  /// Default location of the store file.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::StorageUnavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("rancho").join("offline.db"))
  }

  /// Create tables and indexes, running pending migrations. Safe to call repeatedly.
  pub fn initialize(&self) -> Result<()> {
    self.with_conn(|conn| {
      let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
      if current > SCHEMA_VERSION {
        return Err(SyncError::StorageUnavailable(format!(
          "store schema version {} is newer than supported version {}",
          current, SCHEMA_VERSION
        )));
      }

      for version in current..SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(MIGRATIONS[version as usize])?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        debug!(from = version, to = version + 1, "migrated store schema");
      }

      Ok(())
    })
  }

  /// Close the underlying connection. Later operations fail with `StorageUnavailable`.
  pub fn close(&self) -> Result<()> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;

    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| SyncError::Storage(e))?;
    }
    Ok(())
  }

  pub fn is_open(&self) -> bool {
    self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
  }

  #[cfg(test)]
  pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
    self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
  }

  fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| SyncError::StorageUnavailable("store is closed".into()))?;
    f(conn)
  }

  // ==========================================================================
  // Offline mutation records
  // ==========================================================================

  /// Record a new unsynced mutation and return its id.
  pub fn save_mutation(
    &self,
    resource_type: ResourceType,
    action: MutationAction,
    payload: &serde_json::Value,
  ) -> Result<i64> {
    let payload = serde_json::to_string(payload)?;
    self.with_conn(|conn| Ok(insert_mutation(conn, resource_type, action, &payload)?))
  }

  /// All records for one resource type in insertion order, synced ones included.
  pub fn get_mutations(&self, resource_type: ResourceType) -> Result<Vec<OfflineMutationRecord>> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM offline_mutations WHERE resource_type = ? ORDER BY id",
        MUTATION_COLUMNS
      ))?;
      let rows = stmt
        .query_map(params![resource_type.as_str()], mutation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
  }

  pub fn get_mutation(&self, id: i64) -> Result<Option<OfflineMutationRecord>> {
    self.with_conn(|conn| {
      let record = conn
        .query_row(
          &format!("SELECT {} FROM offline_mutations WHERE id = ?", MUTATION_COLUMNS),
          params![id],
          mutation_from_row,
        )
        .optional()?;
      Ok(record)
    })
  }

  /// Every record not yet confirmed by the remote API, across resource types.
  pub fn get_unsynced_mutations(&self) -> Result<Vec<OfflineMutationRecord>> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM offline_mutations WHERE synced = 0 ORDER BY id",
        MUTATION_COLUMNS
      ))?;
      let rows = stmt
        .query_map([], mutation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
  }

  /// Mark a record as synced. Missing ids are ignored.
  pub fn mark_synced(&self, id: i64) -> Result<()> {
    self.with_conn(|conn| {
      conn.execute(
        "UPDATE offline_mutations SET synced = 1 WHERE id = ?",
        params![id],
      )?;
      Ok(())
    })
  }

  /// Garbage-collect synced records. Returns how many were removed.
  pub fn delete_synced_mutations(&self) -> Result<usize> {
    self.with_conn(|conn| {
      let removed = conn.execute("DELETE FROM offline_mutations WHERE synced = 1", [])?;
      Ok(removed)
    })
  }

  // ==========================================================================
  // Sync queue
  // ==========================================================================

  /// Append a request to the queue and return its id.
  pub fn enqueue(&self, entry: &NewQueueEntry) -> Result<i64> {
    let headers = serde_json::to_string(&entry.headers)?;

    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let id = insert_queue_entry(&tx, entry, &headers, entry.mutation_id)?;
      tx.commit()?;
      Ok(id)
    })
  }

  /// Record a mutation and the queue entry that replays it in one transaction.
  /// Either both rows exist afterwards or neither does. Any `mutation_id` on
  /// `entry` is replaced by the new record's id.
  ///
  /// Returns `(mutation_id, queue_id)`.
  pub fn save_and_enqueue(
    &self,
    resource_type: ResourceType,
    action: MutationAction,
    payload: &serde_json::Value,
    entry: &NewQueueEntry,
  ) -> Result<(i64, i64)> {
    let payload = serde_json::to_string(payload)?;
    let headers = serde_json::to_string(&entry.headers)?;

    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let mutation_id = insert_mutation(&tx, resource_type, action, &payload)?;
      let queue_id = insert_queue_entry(&tx, entry, &headers, Some(mutation_id))?;
      tx.commit()?;
      Ok((mutation_id, queue_id))
    })
  }

  /// Remove an entry after a confirmed replay. Returns whether it existed.
  pub fn dequeue(&self, id: i64) -> Result<bool> {
    self.with_conn(|conn| {
      let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
      Ok(removed > 0)
    })
  }

  /// Entries eligible for replay, oldest first.
  pub fn list_queue(&self) -> Result<Vec<SyncQueueEntry>> {
    self.query_queue("WHERE dead_lettered = 0")
  }

  /// Entries that exhausted their retry budget.
  pub fn list_dead_letters(&self) -> Result<Vec<SyncQueueEntry>> {
    self.query_queue("WHERE dead_lettered = 1")
  }

  pub fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
    self.with_conn(|conn| {
      let entry = conn
        .query_row(
          &format!("SELECT {} FROM sync_queue WHERE id = ?", QUEUE_COLUMNS),
          params![id],
          queue_entry_from_row,
        )
        .optional()?;
      Ok(entry)
    })
  }

  fn query_queue(&self, filter: &str) -> Result<Vec<SyncQueueEntry>> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync_queue {} ORDER BY id",
        QUEUE_COLUMNS, filter
      ))?;
      let rows = stmt
        .query_map([], queue_entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
  }

  /// Count a failed replay. Once `retries` reaches `max_retries` (when non-zero)
  /// the entry is dead-lettered. Returns `None` if the entry no longer exists.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    max_retries: u32,
  ) -> Result<Option<FailureRecord>> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let retries: Option<u32> = tx
        .query_row(
          "SELECT retries FROM sync_queue WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .optional()?;

      let Some(retries) = retries else {
        return Ok(None);
      };

      let retries = retries + 1;
      let dead_lettered = max_retries > 0 && retries >= max_retries;
      tx.execute(
        "UPDATE sync_queue SET retries = ?, last_error = ?, dead_lettered = ? WHERE id = ?",
        params![retries, error, dead_lettered, id],
      )?;
      tx.commit()?;

      Ok(Some(FailureRecord {
        retries,
        dead_lettered,
      }))
    })
  }

  /// Put a dead-lettered entry back in line with a fresh retry budget.
  pub fn requeue(&self, id: i64) -> Result<bool> {
    self.with_conn(|conn| {
      let updated = conn.execute(
        "UPDATE sync_queue SET retries = 0, last_error = NULL, dead_lettered = 0 WHERE id = ?",
        params![id],
      )?;
      Ok(updated > 0)
    })
  }

  // ==========================================================================
  // Response cache
  // ==========================================================================

  /// Insert or replace the cached response for `(namespace, url)`.
  pub fn cache_put(
    &self,
    namespace: &str,
    url: &str,
    response: &StoredResponse,
    ttl: Duration,
  ) -> Result<()> {
    self.cache_put_at(namespace, url, response, ttl, now_millis())
  }

  pub(crate) fn cache_put_at(
    &self,
    namespace: &str,
    url: &str,
    response: &StoredResponse,
    ttl: Duration,
    timestamp: i64,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)?;
    let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

    self.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO response_cache (namespace, url, status, headers, body, timestamp, ttl)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          url,
          response.status,
          headers,
          response.body,
          timestamp,
          ttl
        ],
      )?;
      Ok(())
    })
  }

  /// Read a cached response. Expired entries read as absent but stay in place
  /// until `evict_expired_cache` runs.
  pub fn cache_get(&self, namespace: &str, url: &str) -> Result<Option<CacheEntry>> {
    let entry = self.with_conn(|conn| {
      let entry = conn
        .query_row(
          "SELECT namespace, url, status, headers, body, timestamp, ttl
           FROM response_cache WHERE namespace = ? AND url = ?",
          params![namespace, url],
          cache_entry_from_row,
        )
        .optional()?;
      Ok(entry)
    })?;

    let now = now_millis();
    Ok(entry.filter(|e| !e.is_expired(now)))
  }

  /// Remove every expired cache entry. Returns how many were removed.
  pub fn evict_expired_cache(&self) -> Result<usize> {
    let now = now_millis();
    self.with_conn(|conn| {
      let removed = conn.execute(
        "DELETE FROM response_cache WHERE ? - timestamp >= ttl",
        params![now],
      )?;
      Ok(removed)
    })
  }

  /// Remove every cache entry in every namespace.
  pub fn clear_cache(&self) -> Result<usize> {
    self.with_conn(|conn| {
      let removed = conn.execute("DELETE FROM response_cache", [])?;
      Ok(removed)
    })
  }

  pub fn cache_namespaces(&self) -> Result<Vec<String>> {
    self.with_conn(|conn| {
      let mut stmt =
        conn.prepare("SELECT DISTINCT namespace FROM response_cache ORDER BY namespace")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }

  /// Drop every namespace not listed in `keep`. Returns the number of rows removed.
  pub fn delete_cache_namespaces_except(&self, keep: &[&str]) -> Result<usize> {
    let mut removed = 0;
    for namespace in self.cache_namespaces()? {
      if keep.contains(&namespace.as_str()) {
        continue;
      }
      removed += self.with_conn(|conn| {
        Ok(conn.execute(
          "DELETE FROM response_cache WHERE namespace = ?",
          params![namespace],
        )?)
      })?;
      debug!(namespace = %namespace, "deleted stale cache namespace");
    }
    Ok(removed)
  }

  // ==========================================================================
  // Observability
  // ==========================================================================

  pub fn stats(&self) -> Result<StoreStats> {
    self.with_conn(|conn| {
      let count = |sql: &str| -> rusqlite::Result<u64> { conn.query_row(sql, [], |row| row.get(0)) };

      Ok(StoreStats {
        unsynced_mutations: count("SELECT COUNT(*) FROM offline_mutations WHERE synced = 0")?,
        queued_entries: count("SELECT COUNT(*) FROM sync_queue WHERE dead_lettered = 0")?,
        dead_letters: count("SELECT COUNT(*) FROM sync_queue WHERE dead_lettered = 1")?,
        cache_entries: count("SELECT COUNT(*) FROM response_cache")?,
        last_cache_write: conn.query_row("SELECT MAX(timestamp) FROM response_cache", [], |row| {
          row.get(0)
        })?,
      })
    })
  }
}

fn insert_mutation(
  conn: &Connection,
  resource_type: ResourceType,
  action: MutationAction,
  payload: &str,
) -> rusqlite::Result<i64> {
  conn.execute(
    "INSERT INTO offline_mutations (resource_type, payload, timestamp, synced, action)
     VALUES (?, ?, ?, 0, ?)",
    params![resource_type.as_str(), payload, now_millis(), action.as_str()],
  )?;
  Ok(conn.last_insert_rowid())
}

/// Insert a queue row and stamp its idempotency key. Callers own the transaction.
fn insert_queue_entry(
  conn: &Connection,
  entry: &NewQueueEntry,
  headers: &str,
  mutation_id: Option<i64>,
) -> rusqlite::Result<i64> {
  let method = entry.method.to_ascii_uppercase();
  let timestamp = now_millis();

  conn.execute(
    "INSERT INTO sync_queue (url, method, headers, body, timestamp, retries, mutation_id)
     VALUES (?, ?, ?, ?, ?, 0, ?)",
    params![entry.url, method, headers, entry.body, timestamp, mutation_id],
  )?;
  let id = conn.last_insert_rowid();

  let key = idempotency_key(id, &method, &entry.url, entry.body.as_deref(), timestamp);
  conn.execute(
    "UPDATE sync_queue SET idempotency_key = ? WHERE id = ?",
    params![key, id],
  )?;
  Ok(id)
}

/// Stable key sent with every replay of an entry so the API can drop duplicates.
fn idempotency_key(id: i64, method: &str, url: &str, body: Option<&str>, timestamp: i64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.to_le_bytes());
  hasher.update(method.as_bytes());
  hasher.update([0]);
  hasher.update(url.as_bytes());
  hasher.update([0]);
  hasher.update(body.unwrap_or_default().as_bytes());
  hasher.update([0]);
  hasher.update(timestamp.to_le_bytes());
  hex::encode(hasher.finalize())
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
  E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
  rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<OfflineMutationRecord> {
  let resource_type: String = row.get(1)?;
  let payload: String = row.get(2)?;
  let action: String = row.get(5)?;

  Ok(OfflineMutationRecord {
    id: row.get(0)?,
    resource_type: resource_type
      .parse()
      .map_err(|e: String| conversion_error(1, e))?,
    payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e))?,
    timestamp: row.get(3)?,
    synced: row.get(4)?,
    action: action.parse().map_err(|e: String| conversion_error(5, e))?,
  })
}

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
  let headers: String = row.get(3)?;
  let headers: BTreeMap<String, String> =
    serde_json::from_str(&headers).map_err(|e| conversion_error(3, e))?;

  Ok(SyncQueueEntry {
    id: row.get(0)?,
    url: row.get(1)?,
    method: row.get(2)?,
    headers,
    body: row.get(4)?,
    timestamp: row.get(5)?,
    retries: row.get(6)?,
    mutation_id: row.get(7)?,
    idempotency_key: row.get(8)?,
    last_error: row.get(9)?,
    dead_lettered: row.get(10)?,
  })
}

fn cache_entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
  let headers: String = row.get(3)?;
  let headers: BTreeMap<String, String> =
    serde_json::from_str(&headers).map_err(|e| conversion_error(3, e))?;

  Ok(CacheEntry {
    namespace: row.get(0)?,
    url: row.get(1)?,
    response: StoredResponse {
      status: row.get(2)?,
      headers,
      body: row.get(4)?,
    },
    timestamp: row.get(5)?,
    ttl: row.get(6)?,
  })
}
