//! Request/response values seen at the interception boundary, and the
//! transport that reaches the remote API.

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};
use crate::store::StoredResponse;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// What the response will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  #[default]
  Empty,
}

impl Destination {
  /// Guess the destination from a path's file extension.
  pub fn from_path(path: &str) -> Self {
    let ext = path
      .rsplit('/')
      .next()
      .and_then(|name| name.rsplit_once('.'))
      .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
      Some("js" | "mjs") => Destination::Script,
      Some("css") => Destination::Style,
      Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico") => Destination::Image,
      Some("woff" | "woff2" | "ttf" | "otf" | "eot") => Destination::Font,
      Some("html" | "htm") => Destination::Document,
      _ => Destination::Empty,
    }
  }

  pub fn is_static_asset(&self) -> bool {
    matches!(
      self,
      Destination::Script | Destination::Style | Destination::Image | Destination::Font
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
  #[default]
  Follow,
  Manual,
  Error,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub redirect: RedirectPolicy,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      mode: RequestMode::default(),
      destination: Destination::default(),
      redirect: RedirectPolicy::default(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
    self.redirect = redirect;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_mutation(&self) -> bool {
    matches!(self.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Built locally because neither network nor cache could answer
  Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn network(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  pub fn synthetic(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::from([("content-type".to_string(), content_type.to_string())]),
      body: body.into(),
      source: ResponseSource::Synthetic,
    }
  }

  pub fn synthetic_json(status: u16, value: &serde_json::Value) -> Self {
    Self::synthetic(status, "application/json", value.to_string())
  }

  pub fn from_cache(stored: StoredResponse) -> Self {
    Self {
      status: stored.status,
      headers: stored.headers,
      body: stored.body,
      source: ResponseSource::Cache,
    }
  }

  pub fn to_stored(&self) -> StoredResponse {
    StoredResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  /// Any 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Connection details reported by a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
  /// Negotiated protocol, e.g. "HTTP/1.1"
  pub connection_type: String,
}

/// The path from the engine to the remote API.
///
/// `send` fails only when no HTTP response was obtained; error statuses are
/// returned as ordinary responses.
pub trait Transport: Send + Sync {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;

  /// Cheap reachability check used by the connectivity monitor.
  fn probe(&self) -> BoxFuture<'_, Result<ProbeResult>>;
}

/// reqwest-backed transport that attaches the bearer token.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::NetworkFailure(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn header_map(&self, headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
      // Headers that cannot be represented are dropped rather than failing the request
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        map.insert(name, value);
      }
    }

    if let Some(token) = &self.token {
      if !map.contains_key(AUTHORIZATION) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
          map.insert(AUTHORIZATION, value);
        }
      }
    }
    map
  }
}

impl Transport for HttpTransport {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| SyncError::NetworkFailure(format!("invalid method {}: {}", request.method, e)))?;

      let mut builder = self
        .client
        .request(method, request.url.clone())
        .headers(self.header_map(&request.headers));
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder.send().await.map_err(|e| {
        SyncError::NetworkFailure(format!("{} {} failed: {}", request.method, request.url, e))
      })?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| SyncError::NetworkFailure(format!("failed to read response body: {}", e)))?;

      Ok(Response::network(status, headers, body.to_vec()))
    })
  }

  fn probe(&self) -> BoxFuture<'_, Result<ProbeResult>> {
    Box::pin(async move {
      let response = self
        .client
        .head(self.base_url.clone())
        .send()
        .await
        .map_err(|e| SyncError::NetworkFailure(format!("probe failed: {}", e)))?;

      Ok(ProbeResult {
        connection_type: format!("{:?}", response.version()),
      })
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted transport for exercising the engine without a network.

  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// What the fake network does for a given request.
  #[derive(Debug, Clone)]
  pub enum Reply {
    Respond(u16, &'static str),
    Fail,
    /// Never resolves
    Hang,
  }

  #[derive(Default)]
  pub struct FakeTransport {
    offline: AtomicBool,
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    log: Mutex<Vec<Request>>,
    probes: AtomicUsize,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reply used for every request to `url` once queued replies run out.
    pub fn route(&self, url: &str, reply: Reply) {
      self.defaults.lock().unwrap().insert(url.to_string(), reply);
    }

    /// One-shot reply for the next request to `url`.
    pub fn push(&self, url: &str, reply: Reply) {
      self
        .routes
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(reply);
    }

    pub fn requests(&self) -> Vec<Request> {
      self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
      self.log.lock().unwrap().len()
    }

    pub fn probe_count(&self) -> usize {
      self.probes.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
      if self.offline.load(Ordering::SeqCst) {
        return Reply::Fail;
      }
      if let Some(reply) = self
        .routes
        .lock()
        .unwrap()
        .get_mut(url)
        .and_then(|q| q.pop_front())
      {
        return reply;
      }
      self
        .defaults
        .lock()
        .unwrap()
        .get(url)
        .cloned()
        .unwrap_or(Reply::Respond(404, "not found"))
    }
  }

  impl Transport for FakeTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
      self.log.lock().unwrap().push(request.clone());
      let reply = self.next_reply(request.url.as_str());
      Box::pin(async move {
        match reply {
          Reply::Respond(status, body) => Ok(Response::network(
            status,
            BTreeMap::new(),
            body.as_bytes().to_vec(),
          )),
          Reply::Fail => Err(SyncError::NetworkFailure("connection refused".into())),
          Reply::Hang => futures::future::pending().await,
        }
      })
    }

    fn probe(&self) -> BoxFuture<'_, Result<ProbeResult>> {
      self.probes.fetch_add(1, Ordering::SeqCst);
      let offline = self.offline.load(Ordering::SeqCst);
      Box::pin(async move {
        if offline {
          Err(SyncError::NetworkFailure("unreachable".into()))
        } else {
          Ok(ProbeResult {
            connection_type: "HTTP/1.1".into(),
          })
        }
      })
    }
  }
}
