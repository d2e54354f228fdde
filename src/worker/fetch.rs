//! Per-request caching policy.
//!
//! Precedence, first match wins:
//! 1. Non-GET → bypass
//! 2. Blocked path (auth and session pages) → bypass, whatever is cached
//! 3. Query string → bypass
//! 4. Static asset → cache-first, store successful same-origin responses
//! 5. Anything else → network-first, fall back to the cached shell

use reqwest::Method;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{generation_name, CacheStorage, GenerationKind};
use crate::config::WorkerConfig;
use crate::http::{Request, Response};
use crate::net::{Network, NetworkError};

/// Which rule a request falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  NonGet,
  BlockedPath,
  HasQuery,
  StaticAsset,
  Navigation,
}

impl RequestClass {
  pub fn is_bypass(self) -> bool {
    matches!(self, Self::NonGet | Self::BlockedPath | Self::HasQuery)
  }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Cache,
  Network,
  /// Synthesized 503 for an unreachable, uncached asset
  Offline,
  /// The cached root document standing in for a failed navigation
  ShellFallback,
  /// A cached copy of the exact request after a failed navigation
  CacheFallback,
}

#[derive(Debug)]
pub enum FetchDecision {
  /// The worker stays out of it; the page goes to the network itself
  Bypass(RequestClass),
  Respond {
    response: Response,
    source: ResponseSource,
  },
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network failed and nothing cached: {0}")]
  Network(#[from] NetworkError),
  #[error("worker stopped before answering")]
  WorkerGone,
}

/// The classification rules, independent of any storage.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
  blocked_paths: Vec<String>,
  static_extensions: Vec<String>,
  always_revalidate: Vec<String>,
}

impl FetchPolicy {
  pub fn from_config(config: &WorkerConfig) -> Self {
    Self {
      blocked_paths: config.blocked_paths.iter().map(|p| p.to_lowercase()).collect(),
      static_extensions: config
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      always_revalidate: config.always_revalidate.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    let path = request.url.path();

    if request.method != Method::GET {
      RequestClass::NonGet
    } else if self.is_blocked(path) {
      RequestClass::BlockedPath
    } else if request.url.query().map(|q| !q.is_empty()).unwrap_or(false) {
      RequestClass::HasQuery
    } else if self.is_static_asset(path) {
      RequestClass::StaticAsset
    } else {
      RequestClass::Navigation
    }
  }

  pub fn is_blocked(&self, path: &str) -> bool {
    let path = path.to_lowercase();
    self.blocked_paths.iter().any(|token| path.contains(token.as_str()))
  }

  pub fn is_static_asset(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }

  fn must_revalidate(&self, path: &str) -> bool {
    self.always_revalidate.iter().any(|p| path.contains(p.as_str()))
  }
}

/// Applies the policy against the worker's caches and network.
///
/// Only the generations of the engine's own version are ever read, so a
/// generation that survived eviction can never serve.
pub struct FetchEngine {
  policy: FetchPolicy,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  /// Generation that fetched assets are written to
  dynamic_cache: String,
  static_cache: String,
}

impl FetchEngine {
  pub fn new(
    policy: FetchPolicy,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    version: &str,
  ) -> Self {
    Self {
      policy,
      storage,
      network,
      dynamic_cache: generation_name(GenerationKind::Dynamic, version),
      static_cache: generation_name(GenerationKind::Static, version),
    }
  }

  pub async fn handle(&self, request: &Request) -> Result<FetchDecision, FetchError> {
    let class = self.policy.classify(request);
    debug!(url = %request.url, ?class, "fetch intercepted");

    if class.is_bypass() {
      return Ok(FetchDecision::Bypass(class));
    }

    match class {
      RequestClass::StaticAsset => Ok(self.cache_first(request).await),
      _ => self.network_first(request).await,
    }
  }

  /// Most recently fetched copy first, then the installed shell.
  fn lookup(&self, request: &Request) -> Option<Response> {
    for cache in [&self.dynamic_cache, &self.static_cache] {
      match self.storage.match_in(cache, request) {
        Ok(Some(hit)) => return Some(hit),
        Ok(None) => {}
        Err(e) => warn!(
          cache = %cache,
          url = %request.url,
          error = %e,
          "cache lookup failed, treating as miss"
        ),
      }
    }
    None
  }

  async fn cache_first(&self, request: &Request) -> FetchDecision {
    let cached = self.lookup(request);
    let revalidate = self.policy.must_revalidate(request.url.path());

    if let (Some(response), false) = (&cached, revalidate) {
      return FetchDecision::Respond {
        response: response.clone(),
        source: ResponseSource::Cache,
      };
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          if let Err(e) = self.storage.put(&self.dynamic_cache, request, &response) {
            warn!(url = %request.url, error = %e, "failed to store response");
          }
        }
        FetchDecision::Respond {
          response,
          source: ResponseSource::Network,
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "asset fetch failed");
        match cached {
          Some(response) => FetchDecision::Respond {
            response,
            source: ResponseSource::Cache,
          },
          None => FetchDecision::Respond {
            response: Response::offline(),
            source: ResponseSource::Offline,
          },
        }
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Result<FetchDecision, FetchError> {
    let err = match self.network.fetch(request).await {
      Ok(response) => {
        return Ok(FetchDecision::Respond {
          response,
          source: ResponseSource::Network,
        })
      }
      Err(e) => e,
    };

    warn!(url = %request.url, error = %err, "navigation failed, trying cache");

    if request.accepts_html() {
      if let Some(shell) = request.for_path("/").and_then(|r| self.lookup(&r)) {
        return Ok(FetchDecision::Respond {
          response: shell,
          source: ResponseSource::ShellFallback,
        });
      }
    }

    match self.lookup(request) {
      Some(response) => Ok(FetchDecision::Respond {
        response,
        source: ResponseSource::CacheFallback,
      }),
      None => Err(FetchError::Network(err)),
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use futures::future::BoxFuture;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use url::Url;

  /// Network serving canned responses by path; unknown paths are unreachable.
  #[derive(Default)]
  pub struct StubNetwork {
    routes: Mutex<HashMap<String, Response>>,
    pub calls: AtomicUsize,
  }

  impl StubNetwork {
    pub fn with(routes: &[(&str, Response)]) -> Self {
      let net = Self::default();
      {
        let mut map = net.routes.lock().unwrap();
        for (path, resp) in routes {
          map.insert(path.to_string(), resp.clone());
        }
      }
      net
    }

    pub fn offline() -> Self {
      Self::default()
    }
  }

  impl Network for StubNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
      Box::pin(async move {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self
          .routes
          .lock()
          .unwrap()
          .get(request.url.path())
          .cloned()
          .ok_or_else(|| NetworkError::Unreachable(request.url.to_string()))
      })
    }
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8080").unwrap().join(path).unwrap()
  }

  fn engine(storage: Arc<SqliteStorage>, net: StubNetwork) -> FetchEngine {
    FetchEngine::new(
      FetchPolicy::from_config(&WorkerConfig::default()),
      storage,
      Arc::new(net),
      "v2",
    )
  }

  #[test]
  fn test_classification_precedence() {
    let policy = FetchPolicy::from_config(&WorkerConfig::default());

    let post = Request::get(url("/login.html")).with_method(Method::POST);
    assert_eq!(policy.classify(&post), RequestClass::NonGet);
    assert_eq!(policy.classify(&Request::get(url("/login.html"))), RequestClass::BlockedPath);
    assert_eq!(policy.classify(&Request::get(url("/auth/x"))), RequestClass::BlockedPath);
    assert_eq!(policy.classify(&Request::get(url("/AUTH/logo.png"))), RequestClass::BlockedPath);
    assert_eq!(policy.classify(&Request::get(url("/app.js?v=2"))), RequestClass::HasQuery);
    assert_eq!(policy.classify(&Request::get(url("/style.CSS"))), RequestClass::StaticAsset);
    assert_eq!(policy.classify(&Request::get(url("/home.html"))), RequestClass::Navigation);
    assert_eq!(policy.classify(&Request::get(url("/"))), RequestClass::Navigation);
    assert_eq!(policy.classify(&Request::get(url("/app.js?"))), RequestClass::StaticAsset);
  }

  #[tokio::test]
  async fn test_blocked_path_never_served_or_stored() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    // A previous version cached the login page by mistake
    let login = Request::navigate(url("/login.html"));
    storage.put("static-v1", &login, &Response::new(200, "stale login")).unwrap();
    let before = storage.entry_count().unwrap();

    let net = StubNetwork::with(&[("/login.html", Response::new(200, "fresh login"))]);
    let engine = engine(storage.clone(), net);

    let decision = engine.handle(&login).await.unwrap();
    assert!(matches!(decision, FetchDecision::Bypass(RequestClass::BlockedPath)));
    assert_eq!(storage.entry_count().unwrap(), before);

    let auth_asset = Request::get(url("/auth/x.png"));
    assert!(matches!(
      engine.handle(&auth_asset).await.unwrap(),
      FetchDecision::Bypass(RequestClass::BlockedPath)
    ));
    assert_eq!(storage.entry_count().unwrap(), before);
  }

  #[tokio::test]
  async fn test_static_asset_cache_first() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = StubNetwork::with(&[("/app.css", Response::new(200, "body{}"))]);
    let engine = engine(storage.clone(), net);
    let req = Request::get(url("/app.css"));

    match engine.handle(&req).await.unwrap() {
      FetchDecision::Respond { source, .. } => assert_eq!(source, ResponseSource::Network),
      other => panic!("unexpected {:?}", other),
    }
    assert!(storage.match_in("dynamic-v2", &req).unwrap().is_some());

    match engine.handle(&req).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"body{}");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_unsuccessful_or_opaque_not_stored() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = StubNetwork::with(&[
      ("/missing.js", Response::new(404, "")),
      (
        "/cdn.js",
        Response::new(200, "x").with_kind(crate::http::ResponseType::Opaque),
      ),
    ]);
    let engine = engine(storage.clone(), net);

    engine.handle(&Request::get(url("/missing.js"))).await.unwrap();
    engine.handle(&Request::get(url("/cdn.js"))).await.unwrap();
    assert_eq!(storage.entry_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_static_asset_offline_response() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let engine = engine(storage, StubNetwork::offline());

    match engine.handle(&Request::get(url("/icon.png"))).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::Offline);
        assert_eq!(response.status, 503);
        assert_eq!(response.header("content-type"), Some("text/plain"));
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_manifest_revalidates() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let req = Request::get(url("/manifest.json"));
    storage.put("static-v2", &req, &Response::new(200, "old")).unwrap();

    let net = StubNetwork::with(&[("/manifest.json", Response::new(200, "new"))]);
    let engine = engine(storage, net);

    match engine.handle(&req).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::Network);
        assert_eq!(response.body, b"new");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_shell() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .put("static-v2", &Request::get(url("/")), &Response::new(200, "<shell>"))
      .unwrap();
    let engine = engine(storage, StubNetwork::offline());

    match engine.handle(&Request::navigate(url("/home.html"))).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::ShellFallback);
        assert_eq!(response.body, b"<shell>");
      }
      other => panic!("unexpected {:?}", other),
    }

    // Not HTML and nothing cached for it: the failure propagates
    let result = engine.handle(&Request::get(url("/api/feed"))).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
  }

  #[tokio::test]
  async fn test_only_current_generations_serve() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let req = Request::get(url("/app.js"));
    // An old generation that activation failed to evict
    storage.put("static-v1", &req, &Response::new(200, "stale v1")).unwrap();
    storage.put("dynamic-v2", &req, &Response::new(200, "current v2")).unwrap();
    let engine = engine(storage.clone(), StubNetwork::offline());

    match engine.handle(&req).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"current v2");
      }
      other => panic!("unexpected {:?}", other),
    }

    storage.delete("dynamic-v2").unwrap();
    match engine.handle(&req).await.unwrap() {
      FetchDecision::Respond { source, .. } => assert_eq!(source, ResponseSource::Offline),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_navigation_prefers_network() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .put("static-v2", &Request::get(url("/")), &Response::new(200, "<shell>"))
      .unwrap();
    let net = StubNetwork::with(&[("/", Response::new(200, "<live>"))]);
    let engine = engine(storage, net);

    match engine.handle(&Request::navigate(url("/"))).await.unwrap() {
      FetchDecision::Respond { response, source } => {
        assert_eq!(source, ResponseSource::Network);
        assert_eq!(response.body, b"<live>");
      }
      other => panic!("unexpected {:?}", other),
    }
  }
}
