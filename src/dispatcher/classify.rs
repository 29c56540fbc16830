//! Request classification. Rules are checked in order; the first match wins.

use url::{Origin, Url};

use crate::http::{RedirectPolicy, Request, RequestMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
  /// Different origin than the app: never intercepted
  CrossOrigin,
  /// Navigation that handles its own redirects: never intercepted
  ManualRedirect,
  /// Any other non-GET request: sent to the network, never cached
  Uncached,
  Navigation,
  ApiRead,
  ApiMutation,
  StaticAsset,
  Other,
}

impl RequestCategory {
  pub fn is_pass_through(&self) -> bool {
    matches!(
      self,
      RequestCategory::CrossOrigin | RequestCategory::ManualRedirect | RequestCategory::Uncached
    )
  }
}

/// Decides which category an intercepted request falls into.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  api_prefix: String,
}

impl Classifier {
  pub fn new(app_url: &Url, api_prefix: &str) -> Self {
    Self {
      origin: app_url.origin(),
      api_prefix: normalize_prefix(api_prefix),
    }
  }

  pub fn api_prefix(&self) -> &str {
    &self.api_prefix
  }

  pub fn classify(&self, request: &Request) -> RequestCategory {
    if request.url.origin() != self.origin {
      return RequestCategory::CrossOrigin;
    }

    let navigate = request.mode == RequestMode::Navigate;
    if navigate && request.redirect == RedirectPolicy::Manual {
      return RequestCategory::ManualRedirect;
    }

    let api = self.is_api_path(request.url.path());
    if api && request.is_mutation() {
      return RequestCategory::ApiMutation;
    }

    // Only GET responses are cached, and only GETs may be answered from the cache
    if request.method != "GET" {
      return RequestCategory::Uncached;
    }

    if navigate {
      return RequestCategory::Navigation;
    }

    if api {
      return RequestCategory::ApiRead;
    }

    if request.destination.is_static_asset() {
      return RequestCategory::StaticAsset;
    }

    RequestCategory::Other
  }

  fn is_api_path(&self, path: &str) -> bool {
    match path.strip_prefix(self.api_prefix.as_str()) {
      Some(rest) => rest.is_empty() || rest.starts_with('/'),
      None => false,
    }
  }
}

/// `api`, `/api/` and `/api` all become `/api`.
fn normalize_prefix(prefix: &str) -> String {
  format!("/{}", prefix.trim_matches('/'))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Destination;

  fn classifier() -> Classifier {
    Classifier::new(&Url::parse("https://granja.example/").unwrap(), "api/")
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cross_origin_wins_over_everything() {
    let request = Request::navigate(url("https://cdn.example/api/ganado"));
    assert_eq!(classifier().classify(&request), RequestCategory::CrossOrigin);

    let other_scheme = Request::get(url("http://granja.example/api/ganado"));
    assert_eq!(classifier().classify(&other_scheme), RequestCategory::CrossOrigin);
  }

  #[test]
  fn test_navigation_with_manual_redirect_passes_through() {
    let manual = Request::navigate(url("https://granja.example/login"))
      .with_redirect(RedirectPolicy::Manual);
    assert_eq!(classifier().classify(&manual), RequestCategory::ManualRedirect);
    assert!(RequestCategory::ManualRedirect.is_pass_through());

    let follow = Request::navigate(url("https://granja.example/api/ganado"));
    assert_eq!(classifier().classify(&follow), RequestCategory::Navigation);
  }

  #[test]
  fn test_api_reads_and_mutations() {
    let c = classifier();
    assert_eq!(
      c.classify(&Request::get(url("https://granja.example/api/cultivos?page=2"))),
      RequestCategory::ApiRead
    );
    for method in ["POST", "PUT", "PATCH", "DELETE"] {
      let request = Request::new(method, url("https://granja.example/api/finanzas/3"));
      assert_eq!(c.classify(&request), RequestCategory::ApiMutation);
    }
    // Prefix must end at a segment boundary
    assert_eq!(
      c.classify(&Request::get(url("https://granja.example/apiary"))),
      RequestCategory::Other
    );
  }

  #[test]
  fn test_non_get_requests_outside_api_writes_are_uncached() {
    let c = classifier();
    for method in ["HEAD", "OPTIONS"] {
      let request = Request::new(method, url("https://granja.example/api/cultivos"));
      assert_eq!(c.classify(&request), RequestCategory::Uncached);
    }

    let login = Request::new("POST", url("https://granja.example/login"));
    assert_eq!(c.classify(&login), RequestCategory::Uncached);

    let form = Request::navigate(url("https://granja.example/ganado/nuevo"));
    let form = Request { method: "POST".into(), ..form };
    assert_eq!(c.classify(&form), RequestCategory::Uncached);

    let script = Request::new("HEAD", url("https://granja.example/static/app.js"))
      .with_destination(Destination::Script);
    assert_eq!(c.classify(&script), RequestCategory::Uncached);
    assert!(RequestCategory::Uncached.is_pass_through());
  }

  #[test]
  fn test_static_assets_and_other() {
    let c = classifier();
    let script = Request::get(url("https://granja.example/static/app.js"))
      .with_destination(Destination::Script);
    assert_eq!(c.classify(&script), RequestCategory::StaticAsset);

    let font = Request::get(url("https://granja.example/f.woff2")).with_destination(Destination::Font);
    assert_eq!(c.classify(&font), RequestCategory::StaticAsset);

    let manifest = Request::get(url("https://granja.example/manifest.json"));
    assert_eq!(c.classify(&manifest), RequestCategory::Other);
  }
}
