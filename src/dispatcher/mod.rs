//! Request interception: classify each request, then hand it to the strategy
//! registered for its category.
//!
//! | category          | strategy                                  |
//! |-------------------|-------------------------------------------|
//! | cross-origin      | pass-through                              |
//! | manual redirect   | pass-through                              |
//! | other non-GET     | pass-through                              |
//! | navigation        | stale-while-revalidate, offline page      |
//! | API read          | network-first, empty JSON fallback        |
//! | API mutation      | network, else queue + `202`               |
//! | static asset      | cache-first                               |
//! | anything else     | network-first, `404` fallback             |

mod classify;
mod offline_page;
mod strategy;

pub use classify::{Classifier, RequestCategory};
pub use strategy::{
  capture_request, queued_response, CacheFirst, Fallback, NetworkFirst, PassThrough,
  QueueOnFailure, QueuedMutation, StaleWhileRevalidate, Strategy, StrategyContext,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::http::{Request, Response, Transport};
use crate::lifecycle::CacheNames;
use crate::store::Store;

/// Dispatcher tuning, derived from configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
  pub app_url: Url,
  pub api_prefix: String,
  pub cache_names: CacheNames,
  pub api_ttl: Duration,
  pub asset_ttl: Duration,
  pub page_ttl: Duration,
  /// Longest a navigation waits on the network when a cached copy exists
  pub navigation_timeout: Duration,
}

pub struct Dispatcher {
  classifier: Classifier,
  ctx: StrategyContext,
  strategies: HashMap<RequestCategory, Arc<dyn Strategy>>,
}

impl Dispatcher {
  /// Build a dispatcher with the default strategy for every category.
  pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, settings: &DispatchSettings) -> Self {
    let classifier = Classifier::new(&settings.app_url, &settings.api_prefix);
    let names = &settings.cache_names;

    let pass_through: Arc<dyn Strategy> = Arc::new(PassThrough);
    let mut strategies: HashMap<RequestCategory, Arc<dyn Strategy>> = HashMap::new();
    strategies.insert(RequestCategory::CrossOrigin, Arc::clone(&pass_through));
    strategies.insert(RequestCategory::ManualRedirect, Arc::clone(&pass_through));
    strategies.insert(RequestCategory::Uncached, pass_through);
    strategies.insert(
      RequestCategory::Navigation,
      Arc::new(StaleWhileRevalidate {
        namespace: names.pages.clone(),
        ttl: settings.page_ttl,
        wait: settings.navigation_timeout,
      }),
    );
    strategies.insert(
      RequestCategory::ApiRead,
      Arc::new(NetworkFirst {
        namespace: names.api.clone(),
        ttl: settings.api_ttl,
        fallback: Fallback::EmptyJson,
      }),
    );
    strategies.insert(RequestCategory::ApiMutation, Arc::new(QueueOnFailure));
    strategies.insert(
      RequestCategory::StaticAsset,
      Arc::new(CacheFirst {
        namespace: names.assets.clone(),
        ttl: settings.asset_ttl,
      }),
    );
    strategies.insert(
      RequestCategory::Other,
      Arc::new(NetworkFirst {
        namespace: names.runtime.clone(),
        ttl: settings.page_ttl,
        fallback: Fallback::NotFound,
      }),
    );

    let ctx = StrategyContext {
      store,
      transport,
      api_prefix: classifier.api_prefix().to_string(),
    };

    Self {
      classifier,
      ctx,
      strategies,
    }
  }

  /// Replace the strategy used for one category.
  pub fn with_strategy(mut self, category: RequestCategory, strategy: impl Strategy + 'static) -> Self {
    self.strategies.insert(category, Arc::new(strategy));
    self
  }

  pub fn classify(&self, request: &Request) -> RequestCategory {
    self.classifier.classify(request)
  }

  pub fn api_prefix(&self) -> &str {
    &self.ctx.api_prefix
  }

  /// Resolve a request. Always yields a response.
  pub async fn dispatch(&self, request: Request) -> Response {
    let category = self.classify(&request);
    let strategy = match self.strategies.get(&category) {
      Some(strategy) => Arc::clone(strategy),
      None => Arc::new(PassThrough),
    };

    debug!(
      method = %request.method,
      url = %request.url,
      ?category,
      strategy = strategy.name(),
      "dispatching request"
    );
    strategy.handle(&self.ctx, request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::testing::{FakeTransport, Reply};
  use crate::http::{Destination, ResponseSource};
  use crate::store::{ResourceType, StoredResponse};
  use std::collections::BTreeMap;
  use std::time::Instant;

  const APP: &str = "https://granja.example";

  fn settings() -> DispatchSettings {
    DispatchSettings {
      app_url: Url::parse(APP).unwrap(),
      api_prefix: "/api".into(),
      cache_names: CacheNames::new("rancho", "v1"),
      api_ttl: Duration::from_secs(300),
      asset_ttl: Duration::from_secs(3600),
      page_ttl: Duration::from_secs(600),
      navigation_timeout: Duration::from_millis(50),
    }
  }

  fn setup() -> (Arc<FakeTransport>, Arc<Store>, Dispatcher) {
    let transport = Arc::new(FakeTransport::new());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let dispatcher = Dispatcher::new(store.clone(), transport.clone(), &settings());
    (transport, store, dispatcher)
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", APP, path)).unwrap()
  }

  #[tokio::test]
  async fn test_api_get_falls_back_to_cached_body() {
    let (transport, _store, dispatcher) = setup();
    let target = url("/api/cultivos");
    transport.push(target.as_str(), Reply::Respond(200, r#"[{"id":1,"nombre":"maiz"}]"#));

    let online = dispatcher.dispatch(Request::get(target.clone())).await;
    assert_eq!(online.source, ResponseSource::Network);

    transport.set_offline(true);
    let offline = dispatcher.dispatch(Request::get(target)).await;
    assert_eq!(offline.status, 200);
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.body, online.body);
  }

  #[tokio::test]
  async fn test_api_get_synthesizes_empty_result_with_no_cache() {
    let (transport, _store, dispatcher) = setup();
    transport.set_offline(true);

    let response = dispatcher.dispatch(Request::get(url("/api/ganado"))).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthetic);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["data"], serde_json::json!([]));
  }

  #[tokio::test]
  async fn test_error_statuses_are_returned_but_not_cached() {
    let (transport, store, dispatcher) = setup();
    let target = url("/api/reportes");
    transport.push(target.as_str(), Reply::Respond(500, "boom"));

    let response = dispatcher.dispatch(Request::get(target.clone())).await;
    assert_eq!(response.status, 500);
    assert!(store.cache_get("rancho-api-v1", target.as_str()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_mutation_is_queued_with_202() {
    let (transport, store, dispatcher) = setup();
    transport.set_offline(true);

    let request = Request::new("POST", url("/api/finanzas"))
      .with_header("content-type", "application/json")
      .with_body(r#"{"monto":1500,"tipo":"ingreso"}"#);
    let response = dispatcher.dispatch(request).await;

    assert_eq!(response.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["queued"], true);

    let queue = store.list_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].method, "POST");
    assert_eq!(queue[0].body.as_deref(), Some(r#"{"monto":1500,"tipo":"ingreso"}"#));
    assert_eq!(
      queue[0].headers.get("content-type").map(String::as_str),
      Some("application/json")
    );

    let records = store.get_mutations(ResourceType::FinanceEntry).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(queue[0].mutation_id, Some(records[0].id));
    assert_eq!(records[0].payload["monto"], 1500);
  }

  #[tokio::test]
  async fn test_head_does_not_replace_cached_get_body() {
    let (transport, _store, dispatcher) = setup();
    let target = url("/api/cultivos");
    transport.push(target.as_str(), Reply::Respond(200, r#"[{"id":1}]"#));
    transport.push(target.as_str(), Reply::Respond(200, ""));

    dispatcher.dispatch(Request::get(target.clone())).await;
    let head = dispatcher.dispatch(Request::new("HEAD", target.clone())).await;
    assert_eq!(head.source, ResponseSource::Network);

    transport.set_offline(true);
    let offline = dispatcher.dispatch(Request::get(target)).await;
    assert_eq!(offline.status, 200);
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.text(), r#"[{"id":1}]"#);
  }

  #[tokio::test]
  async fn test_post_outside_api_is_never_served_to_gets() {
    let (transport, store, dispatcher) = setup();
    let target = url("/login");
    transport.push(target.as_str(), Reply::Respond(200, "session-token"));

    let posted = dispatcher
      .dispatch(Request::new("POST", target.clone()).with_body("user=ana"))
      .await;
    assert_eq!(posted.text(), "session-token");
    assert_eq!(store.stats().unwrap().cache_entries, 0);
    assert!(store.list_queue().unwrap().is_empty());

    transport.set_offline(true);
    let offline = dispatcher.dispatch(Request::get(target)).await;
    assert_eq!(offline.status, 404);
    assert_eq!(offline.source, ResponseSource::Synthetic);
  }

  #[tokio::test]
  async fn test_failed_capture_leaves_no_orphan_record() {
    let (transport, store, dispatcher) = setup();
    transport.set_offline(true);
    store
      .execute_batch(
        "CREATE TRIGGER reject_queue BEFORE INSERT ON sync_queue
         BEGIN SELECT RAISE(ABORT, 'queue rejected'); END;",
      )
      .unwrap();

    let request = Request::new("POST", url("/api/finanzas")).with_body(r#"{"monto":10}"#);
    let response = dispatcher.dispatch(request).await;
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["queued"], false);

    assert!(store.get_unsynced_mutations().unwrap().is_empty());
    assert!(store.list_queue().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_mutation_to_unknown_resource_is_queued_without_record() {
    let (transport, store, dispatcher) = setup();
    transport.set_offline(true);

    let response = dispatcher
      .dispatch(Request::new("DELETE", url("/api/sesiones/1")))
      .await;
    assert_eq!(response.status, 202);
    assert_eq!(store.list_queue().unwrap()[0].mutation_id, None);
    assert!(store.get_unsynced_mutations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_online_mutation_goes_straight_through() {
    let (transport, store, dispatcher) = setup();
    let target = url("/api/ganado");
    transport.push(target.as_str(), Reply::Respond(201, r#"{"id":7}"#));

    let response = dispatcher
      .dispatch(Request::new("POST", target).with_body("{}"))
      .await;
    assert_eq!(response.status, 201);
    assert!(store.list_queue().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_reads_are_idempotent() {
    let (transport, _store, dispatcher) = setup();
    let target = url("/static/app.js");
    transport.push(target.as_str(), Reply::Respond(200, "export default 1;"));
    let request = Request::get(target).with_destination(Destination::Script);

    let first = dispatcher.dispatch(request.clone()).await;
    assert_eq!(first.source, ResponseSource::Network);
    let second = dispatcher.dispatch(request.clone()).await;
    let third = dispatcher.dispatch(request).await;

    assert_eq!(transport.request_count(), 1);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.body, first.body);
    assert_eq!(third.body, second.body);
  }

  #[tokio::test]
  async fn test_static_asset_unavailable_offline_is_404() {
    let (transport, _store, dispatcher) = setup();
    transport.set_offline(true);
    let request = Request::get(url("/img/logo.png")).with_destination(Destination::Image);

    let response = dispatcher.dispatch(request).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.source, ResponseSource::Synthetic);
  }

  #[tokio::test]
  async fn test_navigation_updates_cache_then_serves_it_offline() {
    let (transport, _store, dispatcher) = setup();
    let target = url("/ganado");
    transport.push(target.as_str(), Reply::Respond(200, "<html>ganado</html>"));

    let online = dispatcher.dispatch(Request::navigate(target.clone())).await;
    assert_eq!(online.source, ResponseSource::Network);

    transport.set_offline(true);
    let offline = dispatcher.dispatch(Request::navigate(target)).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.text(), "<html>ganado</html>");
  }

  #[tokio::test]
  async fn test_navigation_without_cache_renders_offline_page() {
    let (transport, _store, dispatcher) = setup();
    transport.set_offline(true);

    let response = dispatcher.dispatch(Request::navigate(url("/cultivos/3"))).await;
    assert_eq!(response.source, ResponseSource::Synthetic);
    assert!(response.text().contains("/cultivos/3"));
  }

  #[tokio::test]
  async fn test_navigation_does_not_block_on_hanging_network_when_cached() {
    let (transport, store, dispatcher) = setup();
    let target = url("/finanzas");
    let cached = StoredResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: b"<html>cached</html>".to_vec(),
    };
    store
      .cache_put("rancho-pages-v1", target.as_str(), &cached, Duration::from_secs(60))
      .unwrap();
    transport.route(target.as_str(), Reply::Hang);

    let started = Instant::now();
    let response = tokio::time::timeout(
      Duration::from_secs(2),
      dispatcher.dispatch(Request::navigate(target)),
    )
    .await
    .expect("navigation blocked on the network");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text(), "<html>cached</html>");
  }

  #[tokio::test]
  async fn test_cross_origin_is_not_cached() {
    let (transport, store, dispatcher) = setup();
    let target = Url::parse("https://cdn.example/lib.js").unwrap();
    transport.push(target.as_str(), Reply::Respond(200, "lib"));

    let request = Request::get(target).with_destination(Destination::Script);
    let response = dispatcher.dispatch(request).await;
    assert_eq!(response.status, 200);
    assert_eq!(store.stats().unwrap().cache_entries, 0);

    transport.set_offline(true);
    let request = Request::get(Url::parse("https://cdn.example/lib.js").unwrap());
    assert_eq!(dispatcher.dispatch(request).await.status, 503);
  }

  #[tokio::test]
  async fn test_other_requests_fall_back_to_404() {
    let (transport, _store, dispatcher) = setup();
    transport.set_offline(true);
    let response = dispatcher.dispatch(Request::get(url("/manifest.json"))).await;
    assert_eq!(response.status, 404);
  }

  #[tokio::test]
  async fn test_strategies_are_pluggable() {
    let (transport, _store, dispatcher) = setup();
    let dispatcher = dispatcher.with_strategy(RequestCategory::Other, PassThrough);
    transport.set_offline(true);

    let response = dispatcher.dispatch(Request::get(url("/manifest.json"))).await;
    assert_eq!(response.status, 503);
  }
}
