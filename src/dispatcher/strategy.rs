//! Caching strategies. Each one turns a request into a response and never fails:
//! when neither network nor cache can answer, a response is synthesized.

use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::offline_page;
use crate::error::Result;
use crate::http::{Request, Response, Transport};
use crate::store::{CacheEntry, MutationAction, NewQueueEntry, ResourceType, Store};

/// Shared collaborators handed to every strategy.
pub struct StrategyContext {
  pub store: Arc<Store>,
  pub transport: Arc<dyn Transport>,
  pub api_prefix: String,
}

pub trait Strategy: Send + Sync {
  fn name(&self) -> &'static str;

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response>;
}

/// Only GET requests read from or write to the cache; the key is the URL alone.
fn cacheable(request: &Request) -> bool {
  request.method == "GET"
}

/// Cache read that degrades store errors to a miss.
fn lookup(store: &Store, namespace: &str, request: &Request) -> Option<CacheEntry> {
  if !cacheable(request) {
    return None;
  }
  let url = request.url.as_str();
  match store.cache_get(namespace, url) {
    Ok(entry) => entry,
    Err(e) => {
      warn!(namespace, url, error = %e, "cache read failed, treating as miss");
      None
    }
  }
}

/// Cache successful GET responses; anything else is left alone.
fn remember(store: &Store, namespace: &str, request: &Request, response: &Response, ttl: Duration) {
  if !cacheable(request) || !response.is_success() {
    return;
  }
  let url = request.url.as_str();
  if let Err(e) = store.cache_put(namespace, url, &response.to_stored(), ttl) {
    warn!(namespace, url, error = %e, "cache write failed");
  }
}

fn not_found_offline() -> Response {
  Response::synthetic(404, "text/plain; charset=utf-8", "Not available offline")
}

// ============================================================================
// Pass-through
// ============================================================================

/// Forward untouched; no caching, no queueing.
pub struct PassThrough;

impl Strategy for PassThrough {
  fn name(&self) -> &'static str {
    "pass-through"
  }

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response> {
    Box::pin(async move {
      match ctx.transport.send(&request).await {
        Ok(response) => response,
        Err(e) => {
          debug!(url = %request.url, error = %e, "pass-through request failed");
          Response::synthetic(503, "text/plain; charset=utf-8", "Network unavailable")
        }
      }
    })
  }
}

// ============================================================================
// Cache-first
// ============================================================================

/// Serve from cache when present, otherwise fetch and populate.
pub struct CacheFirst {
  pub namespace: String,
  pub ttl: Duration,
}

impl Strategy for CacheFirst {
  fn name(&self) -> &'static str {
    "cache-first"
  }

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response> {
    Box::pin(async move {
      let key = request.url.as_str();
      if let Some(entry) = lookup(&ctx.store, &self.namespace, &request) {
        debug!(url = key, "cache hit");
        return Response::from_cache(entry.response);
      }

      match ctx.transport.send(&request).await {
        Ok(response) => {
          remember(&ctx.store, &self.namespace, &request, &response, self.ttl);
          response
        }
        Err(e) => {
          debug!(url = key, error = %e, "asset unavailable offline");
          not_found_offline()
        }
      }
    })
  }
}

// ============================================================================
// Network-first
// ============================================================================

/// What to answer when both network and cache come up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  /// `503` with an empty JSON result, for API reads
  EmptyJson,
  NotFound,
}

impl Fallback {
  fn response(&self) -> Response {
    match self {
      Fallback::EmptyJson => Response::synthetic_json(503, &json!({"data": [], "offline": true})),
      Fallback::NotFound => not_found_offline(),
    }
  }
}

pub struct NetworkFirst {
  pub namespace: String,
  pub ttl: Duration,
  pub fallback: Fallback,
}

impl Strategy for NetworkFirst {
  fn name(&self) -> &'static str {
    "network-first"
  }

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response> {
    Box::pin(async move {
      let key = request.url.as_str();
      match ctx.transport.send(&request).await {
        Ok(response) => {
          remember(&ctx.store, &self.namespace, &request, &response, self.ttl);
          response
        }
        Err(e) => match lookup(&ctx.store, &self.namespace, &request) {
          Some(entry) => {
            debug!(url = key, error = %e, "network failed, serving cache");
            Response::from_cache(entry.response)
          }
          None => {
            debug!(url = key, error = %e, "network failed with nothing cached");
            self.fallback.response()
          }
        },
      }
    })
  }
}

// ============================================================================
// Stale-while-revalidate
// ============================================================================

/// Always refresh from the network, but when a cached copy exists never make the
/// caller wait longer than `wait` for it. A refresh that outlives the wait keeps
/// running and updates the cache when it lands.
pub struct StaleWhileRevalidate {
  pub namespace: String,
  pub ttl: Duration,
  pub wait: Duration,
}

impl Strategy for StaleWhileRevalidate {
  fn name(&self) -> &'static str {
    "stale-while-revalidate"
  }

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response> {
    Box::pin(async move {
      let key = request.url.to_string();
      let path = request.url.path().to_string();
      let cached = lookup(&ctx.store, &self.namespace, &request);

      let refresh = {
        let store = Arc::clone(&ctx.store);
        let transport = Arc::clone(&ctx.transport);
        let namespace = self.namespace.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
          let response = transport.send(&request).await?;
          remember(&store, &namespace, &request, &response, ttl);
          Ok::<_, crate::error::SyncError>(response)
        })
      };

      match cached {
        Some(entry) => match tokio::time::timeout(self.wait, refresh).await {
          Ok(Ok(Ok(response))) => response,
          Ok(Ok(Err(e))) => {
            debug!(url = %key, error = %e, "revalidation failed, serving cache");
            Response::from_cache(entry.response)
          }
          Ok(Err(e)) => {
            warn!(url = %key, error = %e, "revalidation task aborted");
            Response::from_cache(entry.response)
          }
          Err(_) => {
            debug!(url = %key, "network slow, serving cache while revalidating");
            Response::from_cache(entry.response)
          }
        },
        None => match refresh.await {
          Ok(Ok(response)) => response,
          Ok(Err(e)) => {
            info!(url = %key, error = %e, "navigation failed offline");
            offline_page::render(&path)
          }
          Err(e) => {
            warn!(url = %key, error = %e, "navigation task aborted");
            offline_page::render(&path)
          }
        },
      }
    })
  }
}

// ============================================================================
// Queue on failure
// ============================================================================

/// Identifiers assigned when a mutation is captured for later replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedMutation {
  pub queue_id: i64,
  /// Set when the path named a known resource
  pub mutation_id: Option<i64>,
}

/// Persist a mutating request: a mutation record when the resource is known,
/// and always a sync queue entry linked to it.
pub fn capture_request(
  store: &Store,
  api_prefix: &str,
  request: &Request,
) -> Result<QueuedMutation> {
  let resource = ResourceType::from_api_path(request.url.path(), api_prefix);
  let action = MutationAction::from_method(&request.method);

  let entry = NewQueueEntry {
    url: request.url.to_string(),
    method: request.method.clone(),
    headers: request.headers.clone(),
    body: request.body.clone(),
    mutation_id: None,
  };

  match (resource, action) {
    (Some(resource), Some(action)) => {
      let payload = match request.body.as_deref() {
        Some(body) => serde_json::from_str(body).unwrap_or_else(|_| json!(body)),
        None => json!({ "url": request.url.as_str() }),
      };
      let (mutation_id, queue_id) = store.save_and_enqueue(resource, action, &payload, &entry)?;
      Ok(QueuedMutation {
        queue_id,
        mutation_id: Some(mutation_id),
      })
    }
    _ => Ok(QueuedMutation {
      queue_id: store.enqueue(&entry)?,
      mutation_id: None,
    }),
  }
}

/// The optimistic answer for a mutation that was queued instead of sent.
pub fn queued_response(queued: QueuedMutation) -> Response {
  Response::synthetic_json(
    202,
    &json!({
      "offline": true,
      "queued": true,
      "queueId": queued.queue_id,
      "mutationId": queued.mutation_id,
      "message": "Saved offline; it will sync when the connection returns",
    }),
  )
}

/// Send mutations straight through; capture them into the sync queue when the
/// network cannot be reached.
pub struct QueueOnFailure;

impl Strategy for QueueOnFailure {
  fn name(&self) -> &'static str {
    "queue-on-failure"
  }

  fn handle<'a>(&'a self, ctx: &'a StrategyContext, request: Request) -> BoxFuture<'a, Response> {
    Box::pin(async move {
      let error = match ctx.transport.send(&request).await {
        Ok(response) => return response,
        Err(e) => e,
      };

      match capture_request(&ctx.store, &ctx.api_prefix, &request) {
        Ok(queued) => {
          info!(
            method = %request.method,
            url = %request.url,
            queue_id = queued.queue_id,
            reason = %error,
            "queued mutation for sync"
          );
          queued_response(queued)
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "failed to queue offline mutation");
          Response::synthetic_json(
            503,
            &json!({"offline": true, "queued": false, "error": e.to_string()}),
          )
        }
      }
    })
  }
}
