//! Replays the sync queue against the remote API.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SyncError};
use crate::http::{Request, Transport};
use crate::store::{Store, SyncQueueEntry};

/// Header carrying the per-entry idempotency key on every replay.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Result of replaying one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
  pub id: i64,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Status returned by the API, if it answered
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  /// The entry ran out of retries and will not be replayed again automatically
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub dead_lettered: bool,
}

/// Drains the queue sequentially, oldest entry first.
///
/// A failing entry is left in place with its retry count bumped and the run
/// moves on, so one bad request cannot hold up the rest.
pub struct SyncProcessor {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  max_retries: u32,
  syncing: AtomicBool,
}

/// Clears the syncing flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl SyncProcessor {
  pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, max_retries: u32) -> Self {
    Self {
      store,
      transport,
      max_retries,
      syncing: AtomicBool::new(false),
    }
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::SeqCst)
  }

  /// Replay every eligible entry once. Overlapping runs are rejected with
  /// `SyncInProgress`. Only a failure to read the queue aborts the run; any
  /// error on a single entry becomes that entry's outcome.
  pub async fn run(&self) -> Result<Vec<SyncOutcome>> {
    if self
      .syncing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Err(SyncError::SyncInProgress);
    }
    let _guard = RunGuard(&self.syncing);

    let queue = self.store.list_queue()?;
    if queue.is_empty() {
      debug!("sync queue empty");
      return Ok(Vec::new());
    }

    info!(entries = queue.len(), "replaying sync queue");
    let mut outcomes = Vec::with_capacity(queue.len());
    for entry in &queue {
      let outcome = match self.replay(entry).await {
        Ok(outcome) => outcome,
        Err(e) => {
          warn!(id = entry.id, error = %e, "store error while replaying queue entry");
          SyncOutcome {
            id: entry.id,
            success: false,
            error: Some(e.to_string()),
            status: None,
            dead_lettered: false,
          }
        }
      };
      outcomes.push(outcome);
    }

    let synced = outcomes.iter().filter(|o| o.success).count();
    info!(
      synced,
      failed = outcomes.len() - synced,
      "sync run finished"
    );
    Ok(outcomes)
  }

  async fn replay(&self, entry: &SyncQueueEntry) -> Result<SyncOutcome> {
    let request = match build_request(entry) {
      Ok(request) => request,
      Err(e) => return self.fail(entry, e, None),
    };

    match self.transport.send(&request).await {
      Ok(response) if response.is_success() => {
        // Mark first: a crash before dequeue replays the entry, which the
        // idempotency key makes harmless
        if let Some(mutation_id) = entry.mutation_id {
          self.store.mark_synced(mutation_id)?;
        }
        self.store.dequeue(entry.id)?;
        debug!(id = entry.id, status = response.status, "replayed queue entry");

        Ok(SyncOutcome {
          id: entry.id,
          success: true,
          error: None,
          status: Some(response.status),
          dead_lettered: false,
        })
      }
      Ok(response) => {
        let reason = SyncError::ReplayFailure {
          id: entry.id,
          reason: format!("HTTP {}", response.status),
        };
        self.fail(entry, reason, Some(response.status))
      }
      Err(e) => {
        let reason = SyncError::ReplayFailure {
          id: entry.id,
          reason: e.to_string(),
        };
        self.fail(entry, reason, None)
      }
    }
  }

  fn fail(&self, entry: &SyncQueueEntry, error: SyncError, status: Option<u16>) -> Result<SyncOutcome> {
    let message = error.to_string();
    let record = self
      .store
      .record_failure(entry.id, &message, self.max_retries)?;
    let dead_lettered = record.map(|r| r.dead_lettered).unwrap_or(false);

    if dead_lettered {
      warn!(id = entry.id, url = %entry.url, error = %message, "queue entry dead-lettered");
    } else {
      warn!(
        id = entry.id,
        url = %entry.url,
        retries = record.map(|r| r.retries).unwrap_or(entry.retries),
        error = %message,
        "replay failed"
      );
    }

    Ok(SyncOutcome {
      id: entry.id,
      success: false,
      error: Some(message),
      status,
      dead_lettered,
    })
  }
}

/// Rebuild the captured request, tagged with its idempotency key.
fn build_request(entry: &SyncQueueEntry) -> Result<Request> {
  let url = Url::parse(&entry.url).map_err(|e| SyncError::ReplayFailure {
    id: entry.id,
    reason: format!("invalid url '{}': {}", entry.url, e),
  })?;

  let mut request = Request::new(&entry.method, url);
  request.headers = entry.headers.clone();
  request.body = entry.body.clone();
  Ok(request.with_header(IDEMPOTENCY_HEADER, &entry.idempotency_key))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dispatcher::capture_request;
  use crate::http::testing::{FakeTransport, Reply};
  use crate::store::{NewQueueEntry, ResourceType};
  use std::collections::BTreeMap;
  use std::time::Duration;

  const APP: &str = "https://granja.example";

  fn setup(max_retries: u32) -> (Arc<FakeTransport>, Arc<Store>, Arc<SyncProcessor>) {
    let transport = Arc::new(FakeTransport::new());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let processor = Arc::new(SyncProcessor::new(
      store.clone(),
      transport.clone(),
      max_retries,
    ));
    (transport, store, processor)
  }

  fn enqueue(store: &Store, method: &str, path: &str) -> i64 {
    store
      .enqueue(&NewQueueEntry {
        url: format!("{}{}", APP, path),
        method: method.into(),
        headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
        body: Some(r#"{"x":1}"#.into()),
        mutation_id: None,
      })
      .unwrap()
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let (transport, store, processor) = setup(5);
    for path in ["/api/a", "/api/b", "/api/c"] {
      enqueue(&store, "POST", path);
      transport.route(&format!("{}{}", APP, path), Reply::Respond(200, "{}"));
    }

    let outcomes = processor.run().await.unwrap();
    assert!(outcomes.iter().all(|o| o.success));

    let paths: Vec<String> = transport
      .requests()
      .iter()
      .map(|r| r.url.path().to_string())
      .collect();
    assert_eq!(paths, vec!["/api/a", "/api/b", "/api/c"]);
    assert!(store.list_queue().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failures_do_not_abort_the_batch() {
    let (transport, store, processor) = setup(5);
    let a = enqueue(&store, "PUT", "/api/ganado/1");
    let b = enqueue(&store, "POST", "/api/ganado");
    let c = enqueue(&store, "DELETE", "/api/ganado/2");
    transport.route(&format!("{}/api/ganado/1", APP), Reply::Respond(500, "boom"));
    transport.route(&format!("{}/api/ganado", APP), Reply::Respond(201, "{}"));
    transport.route(&format!("{}/api/ganado/2", APP), Reply::Fail);

    let outcomes = processor.run().await.unwrap();
    let summary: Vec<(i64, bool)> = outcomes.iter().map(|o| (o.id, o.success)).collect();
    assert_eq!(summary, vec![(a, false), (b, true), (c, false)]);
    assert_eq!(outcomes[0].status, Some(500));
    assert!(outcomes[0].error.as_deref().unwrap().contains("HTTP 500"));
    assert_eq!(outcomes[2].status, None);

    let remaining = store.list_queue().unwrap();
    assert_eq!(remaining.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, c]);
    assert!(remaining.iter().all(|e| e.retries == 1));
  }

  #[tokio::test]
  async fn test_success_marks_linked_mutation_synced() {
    let (transport, store, processor) = setup(5);
    let url = Url::parse(&format!("{}/api/finanzas", APP)).unwrap();
    let request = Request::new("POST", url.clone()).with_body(r#"{"monto":10}"#);
    let queued = capture_request(&store, "/api", &request).unwrap();
    assert_eq!(store.stats().unwrap().queued_entries, 1);

    transport.route(url.as_str(), Reply::Respond(200, "{}"));
    let outcomes = processor.run().await.unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(store.stats().unwrap().queued_entries, 0);
    let record = store.get_mutation(queued.mutation_id.unwrap()).unwrap().unwrap();
    assert!(record.synced);
    assert!(store.get_unsynced_mutations().unwrap().is_empty());
    assert_eq!(store.get_mutations(ResourceType::FinanceEntry).unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_replay_keeps_mutation_unsynced_and_bumps_retries() {
    let (transport, store, processor) = setup(5);
    let url = Url::parse(&format!("{}/api/cultivos", APP)).unwrap();
    let queued = capture_request(&store, "/api", &Request::new("POST", url.clone())).unwrap();
    transport.route(url.as_str(), Reply::Respond(422, "invalid"));

    let outcomes = processor.run().await.unwrap();
    assert!(!outcomes[0].success);

    let record = store.get_mutation(queued.mutation_id.unwrap()).unwrap().unwrap();
    assert!(!record.synced);
    let entry = store.get_queue_entry(queued.queue_id).unwrap().unwrap();
    assert_eq!(entry.retries, 1);
    assert_eq!(entry.last_error.as_deref(), outcomes[0].error.as_deref());
  }

  #[tokio::test]
  async fn test_replay_sends_idempotency_key_and_captured_headers() {
    let (transport, store, processor) = setup(5);
    let id = enqueue(&store, "POST", "/api/reportes");
    let key = store.get_queue_entry(id).unwrap().unwrap().idempotency_key;
    transport.route(&format!("{}/api/reportes", APP), Reply::Respond(200, "{}"));

    processor.run().await.unwrap();
    let sent = &transport.requests()[0];
    assert_eq!(sent.method, "POST");
    assert_eq!(sent.headers.get(IDEMPOTENCY_HEADER), Some(&key));
    assert_eq!(
      sent.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
    assert_eq!(sent.body.as_deref(), Some(r#"{"x":1}"#));
  }

  #[tokio::test]
  async fn test_entries_dead_letter_after_max_retries() {
    let (transport, store, processor) = setup(2);
    let id = enqueue(&store, "POST", "/api/ganado");
    transport.route(&format!("{}/api/ganado", APP), Reply::Fail);

    let first = processor.run().await.unwrap();
    assert!(!first[0].dead_lettered);
    let second = processor.run().await.unwrap();
    assert!(second[0].dead_lettered);

    // Dead letters are skipped by later runs
    assert!(processor.run().await.unwrap().is_empty());
    assert_eq!(transport.request_count(), 2);
    assert_eq!(store.list_dead_letters().unwrap()[0].id, id);
  }

  #[tokio::test]
  async fn test_invalid_url_is_recorded_as_failure() {
    let (_transport, store, processor) = setup(5);
    store
      .enqueue(&NewQueueEntry {
        url: "not a url".into(),
        method: "POST".into(),
        ..Default::default()
      })
      .unwrap();

    let outcomes = processor.run().await.unwrap();
    assert!(!outcomes[0].success);
    assert!(outcomes[0].error.as_deref().unwrap().contains("invalid url"));
    assert_eq!(store.list_queue().unwrap()[0].retries, 1);
  }

  #[tokio::test]
  async fn test_store_error_on_one_entry_keeps_other_outcomes() {
    let (transport, store, processor) = setup(5);
    let a = enqueue(&store, "POST", "/api/ganado");
    let b = enqueue(&store, "POST", "/api/cultivos");
    let c = enqueue(&store, "POST", "/api/finanzas");
    for path in ["/api/ganado", "/api/cultivos", "/api/finanzas"] {
      transport.route(&format!("{}{}", APP, path), Reply::Respond(200, "{}"));
    }
    store
      .execute_batch(&format!(
        "CREATE TRIGGER pin_entry BEFORE DELETE ON sync_queue WHEN OLD.id = {} \
         BEGIN SELECT RAISE(ABORT, 'delete rejected'); END;",
        b
      ))
      .unwrap();

    let outcomes = processor.run().await.unwrap();
    let summary: Vec<(i64, bool)> = outcomes.iter().map(|o| (o.id, o.success)).collect();
    assert_eq!(summary, vec![(a, true), (b, false), (c, true)]);
    assert!(outcomes[1].error.as_deref().unwrap().contains("delete rejected"));
    assert_eq!(transport.request_count(), 3);

    let remaining = store.list_queue().unwrap();
    assert_eq!(remaining.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b]);
    assert!(!processor.is_syncing());
  }

  #[tokio::test]
  async fn test_overlapping_runs_are_rejected() {
    let (transport, store, processor) = setup(5);
    enqueue(&store, "POST", "/api/ganado");
    transport.route(&format!("{}/api/ganado", APP), Reply::Hang);

    let background = Arc::clone(&processor);
    let running = tokio::spawn(async move { background.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(processor.is_syncing());
    assert!(matches!(processor.run().await, Err(SyncError::SyncInProgress)));
    running.abort();
  }

  #[tokio::test]
  async fn test_guard_resets_after_run() {
    let (_transport, _store, processor) = setup(5);
    assert!(processor.run().await.unwrap().is_empty());
    assert!(!processor.is_syncing());
    assert!(processor.run().await.is_ok());
  }

  #[test]
  fn test_outcome_serializes_for_the_ui() {
    let outcome = SyncOutcome {
      id: 3,
      success: false,
      error: Some("HTTP 500".into()),
      status: Some(500),
      dead_lettered: false,
    };
    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(
      value,
      serde_json::json!({"id": 3, "success": false, "error": "HTTP 500", "status": 500})
    );
  }
}
