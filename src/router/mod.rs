//! Offline cache router.
//!
//! Decides, per request, whether to answer from a cache namespace, from the
//! network, or from both, and keeps the namespaces pruned to the current
//! version:
//! - API requests: cache-first, refreshed in the background
//! - Static assets: cache-first
//! - Navigations: network-first, falling back to the cached root document
//! - Everything else: network-first, falling back to any cached copy
//!
//! Only 2xx responses to GET requests are ever written.

mod classify;

pub use classify::{classify, RequestClass};

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::config::{RouterConfig, SyncConfig};
use crate::net::{Network, Request, Response};
use crate::sync::SyncQueue;

const STATIC_OFFLINE_MESSAGE: &str = "Resource not available offline";
const PAGE_OFFLINE_MESSAGE: &str = "Page not available offline";

/// Request router over a cache store and a network transport.
pub struct CacheRouter<S, N> {
  storage: Arc<S>,
  network: Arc<N>,
  origin: Url,
  config: Arc<RouterConfig>,
  sync: Arc<SyncConfig>,
}

impl<S, N> CacheRouter<S, N>
where
  S: CacheStorage + SyncQueue + 'static,
  N: Network,
{
  pub fn new(storage: S, network: N, origin: Url, config: RouterConfig) -> Self {
    Self {
      storage: Arc::new(storage),
      network: Arc::new(network),
      origin,
      config: Arc::new(config),
      sync: Arc::new(SyncConfig::default()),
    }
  }

  /// Set how failed writes are queued for background sync.
  pub fn with_sync(mut self, sync: SyncConfig) -> Self {
    self.sync = Arc::new(sync);
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn config(&self) -> &RouterConfig {
    &self.config
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid resource path '{}': {}", path, e))
  }

  /// Pre-populate the static namespace with the critical resources.
  ///
  /// All resources are fetched before anything is written; if any fetch
  /// fails or returns a non-2xx status, nothing is stored and install fails.
  pub async fn install(&self) -> Result<()> {
    self.storage.open_namespace(&self.config.static_namespace)?;
    self.storage.open_namespace(&self.config.api_namespace)?;

    let requests = self
      .config
      .critical_resources
      .iter()
      .map(|path| self.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.ok() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          request,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    });
    let responses = try_join_all(fetches).await?;

    for (request, response) in requests.iter().zip(&responses) {
      self.storage.put(
        &self.config.static_namespace,
        &RequestKey::from_request(request),
        response,
      )?;
    }

    info!(
      namespace = %self.config.static_namespace,
      resources = requests.len(),
      "Pre-cached critical resources"
    );
    Ok(())
  }

  /// Delete every namespace not belonging to the current version.
  ///
  /// Returns the names of the deleted namespaces.
  pub fn activate(&self) -> Result<Vec<String>> {
    let allowed = self.config.allowed_namespaces();
    let mut removed = Vec::new();

    for name in self.storage.namespaces()? {
      if allowed.contains(&name.as_str()) {
        continue;
      }
      if self.storage.delete_namespace(&name)? {
        info!(namespace = %name, "Deleted outdated cache namespace");
        removed.push(name);
      }
    }

    Ok(removed)
  }

  /// Route one request.
  ///
  /// API, static and navigation requests always produce a response,
  /// synthesizing a 503 when neither network nor cache can answer. Only
  /// the "other" class can return an error.
  pub async fn handle(&self, request: Request) -> Result<Response> {
    let class = classify(&request, &self.config.api_prefixes);
    debug!(%request, %class, "Routing request");

    match class {
      RequestClass::Api => Ok(self.serve_api(request).await),
      RequestClass::StaticAsset => Ok(self.serve_static(request).await),
      RequestClass::Navigation => Ok(self.serve_navigation(request).await),
      RequestClass::Other => self.serve_other(request).await,
    }
  }

  /// Cache-first with background refresh.
  async fn serve_api(&self, request: Request) -> Response {
    let namespace = &self.config.api_namespace;

    if let Some(hit) = self.cached(namespace, &request) {
      debug!(%request, "API cache hit, refreshing in background");
      self.spawn_refresh(request);
      return hit;
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        self.store(namespace, &request, &response);
        response
      }
      Err(e) => {
        warn!(%request, error = %e, "API request failed with no cached copy");
        if !request.is_get() && self.sync.queue_failed_writes {
          self.queue_for_sync(&request);
        }
        Response::offline_json()
      }
    }
  }

  /// Cache-first, no refresh.
  async fn serve_static(&self, request: Request) -> Response {
    let namespace = &self.config.static_namespace;

    if let Some(hit) = self.cached(namespace, &request) {
      return hit;
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        self.store(namespace, &request, &response);
        response
      }
      Err(e) => {
        warn!(%request, error = %e, "Static asset unavailable");
        Response::offline_text(STATIC_OFFLINE_MESSAGE)
      }
    }
  }

  /// Network-first, falling back to the cached root document.
  async fn serve_navigation(&self, request: Request) -> Response {
    match self.network.fetch(&request).await {
      Ok(response) => {
        self.store(&self.config.static_namespace, &request, &response);
        response
      }
      Err(e) => {
        warn!(%request, error = %e, "Navigation failed, trying cached root document");
        match self.root_document() {
          Some(root) => root,
          None => Response::offline_text(PAGE_OFFLINE_MESSAGE),
        }
      }
    }
  }

  /// Network-first with a bare cache fallback and no write.
  async fn serve_other(&self, request: Request) -> Result<Response> {
    match self.network.fetch(&request).await {
      Ok(response) => Ok(response),
      Err(e) => {
        if request.is_get() {
          match self.storage.lookup_any(&RequestKey::from_request(&request)) {
            Ok(Some(hit)) => {
              debug!(%request, "Serving cached copy after network failure");
              return Ok(hit.response);
            }
            Ok(None) => {}
            Err(lookup) => warn!(%request, error = %lookup, "Cache lookup failed"),
          }
        }
        Err(e)
      }
    }
  }

  /// Fetch in a detached task and overwrite the API entry on success.
  ///
  /// The task is not awaited; it may not finish before the process exits.
  fn spawn_refresh(&self, request: Request) {
    let router = self.clone();
    tokio::spawn(async move {
      match router.network.fetch(&request).await {
        Ok(response) => router.store(&router.config.api_namespace, &request, &response),
        Err(e) => warn!(%request, error = %e, "Background refresh failed, keeping cached copy"),
      }
    });
  }

  fn root_document(&self) -> Option<Response> {
    let root = RequestKey::get(&self.origin.join("/").ok()?);
    match self.storage.lookup_any(&root) {
      Ok(hit) => hit.map(|h| h.response),
      Err(e) => {
        warn!(error = %e, "Failed to read cached root document");
        None
      }
    }
  }

  /// Cache lookup for GET requests. Storage errors count as a miss.
  fn cached(&self, namespace: &str, request: &Request) -> Option<Response> {
    if !request.is_get() {
      return None;
    }
    match self
      .storage
      .lookup(namespace, &RequestKey::from_request(request))
    {
      Ok(hit) => hit.map(|h| h.response),
      Err(e) => {
        warn!(%request, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Write a response if it is a 2xx answer to a GET.
  fn store(&self, namespace: &str, request: &Request, response: &Response) {
    if !request.is_get() || !response.ok() {
      return;
    }
    if let Err(e) = self
      .storage
      .put(namespace, &RequestKey::from_request(request), response)
    {
      warn!(%request, error = %e, "Failed to write cache entry");
    }
  }

  fn queue_for_sync(&self, request: &Request) {
    match self.storage.enqueue(&self.sync.tag, request) {
      Ok(id) => info!(%request, id, tag = %self.sync.tag, "Queued request for background sync"),
      Err(e) => warn!(%request, error = %e, "Failed to queue request for background sync"),
    }
  }
}

impl<S, N> Clone for CacheRouter<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
      config: Arc::clone(&self.config),
      sync: Arc::clone(&self.sync),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedResponse, MemoryStorage, SqliteStorage};
  use crate::net::mock::ScriptedNetwork;
  use crate::net::Destination;
  use crate::sync::SyncItem;
  use reqwest::Method;
  use std::time::Duration;

  const ORIGIN: &str = "https://parking.example.com";

  type TestRouter = CacheRouter<SqliteStorage, Arc<ScriptedNetwork>>;

  fn router() -> (TestRouter, Arc<ScriptedNetwork>) {
    let network = Arc::new(ScriptedNetwork::new());
    let router = CacheRouter::new(
      SqliteStorage::in_memory().unwrap(),
      Arc::clone(&network),
      Url::parse(ORIGIN).unwrap(),
      RouterConfig {
        critical_resources: vec!["/".to_string(), "/index.html".to_string()],
        ..RouterConfig::default()
      },
    );
    (router, network)
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn full(path: &str) -> String {
    url(path).to_string()
  }

  fn api_ns(router: &TestRouter) -> String {
    router.config().api_namespace.clone()
  }

  fn static_ns(router: &TestRouter) -> String {
    router.config().static_namespace.clone()
  }

  async fn wait_for_body(router: &TestRouter, namespace: &str, path: &str, body: &str) -> bool {
    for _ in 0..100 {
      let hit = router
        .storage()
        .lookup(namespace, &RequestKey::get(&url(path)))
        .unwrap();
      if hit.map(|h| h.response.text()).as_deref() == Some(body) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  // ---------------------------------------------------------------------------
  // API
  // ---------------------------------------------------------------------------

  #[tokio::test]
  async fn test_api_hit_returns_cached_and_refreshes() {
    let (router, network) = router();
    router
      .storage()
      .put(&api_ns(&router), &RequestKey::get(&url("/api/spots")), &Response::new(200, "old"))
      .unwrap();
    network.respond(&full("/api/spots"), Response::new(200, "new"));

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.text(), "old");

    assert!(wait_for_body(&router, &api_ns(&router), "/api/spots", "new").await);
    assert_eq!(network.calls(), vec![format!("GET {}", full("/api/spots"))]);
  }

  #[tokio::test]
  async fn test_api_hit_does_not_wait_for_network() {
    let network = Arc::new(ScriptedNetwork::new().with_delay(Duration::from_secs(5)));
    let router = CacheRouter::new(
      MemoryStorage::new(),
      Arc::clone(&network),
      Url::parse(ORIGIN).unwrap(),
      RouterConfig::default(),
    );
    router
      .storage()
      .put("parking-api-v1", &RequestKey::get(&url("/api/spots")), &Response::new(200, "cached"))
      .unwrap();

    let response = tokio::time::timeout(
      Duration::from_secs(1),
      router.handle(Request::get(url("/api/spots"))),
    )
    .await
    .expect("cached API response should not wait on the network")
    .unwrap();

    assert_eq!(response.text(), "cached");
  }

  #[tokio::test]
  async fn test_api_refresh_failure_keeps_cached_copy() {
    let (router, network) = router();
    router
      .storage()
      .put(&api_ns(&router), &RequestKey::get(&url("/api/spots")), &Response::new(200, "old"))
      .unwrap();
    network.set_offline(true);

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.text(), "old");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let hit = router
      .storage()
      .lookup(&api_ns(&router), &RequestKey::get(&url("/api/spots")))
      .unwrap();
    assert_eq!(hit.unwrap().response.text(), "old");
  }

  #[tokio::test]
  async fn test_api_miss_fetches_and_stores() {
    let (router, network) = router();
    network.respond(&full("/api/spots"), Response::new(200, "[1,2]"));

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.text(), "[1,2]");

    let hit = router
      .storage()
      .lookup(&api_ns(&router), &RequestKey::get(&url("/api/spots")))
      .unwrap();
    assert_eq!(hit.unwrap().response.text(), "[1,2]");
  }

  #[tokio::test]
  async fn test_api_miss_offline_synthesizes_json_503() {
    let (router, network) = router();
    network.set_offline(true);

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Content-Type"), Some("application/json"));

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body.get("error").is_some());
  }

  #[tokio::test]
  async fn test_api_error_status_is_returned_but_not_stored() {
    let (router, network) = router();
    network.respond(&full("/api/spots"), Response::new(500, "oops"));

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.status, 500);
    assert!(router.storage().keys(&api_ns(&router)).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_non_get_is_never_written() {
    let (router, network) = router();
    for path in ["/api/bookings", "/assets/logo.png", "/contact", "/upload"] {
      network.respond(&full(path), Response::new(200, "ok"));
    }

    let requests = vec![
      Request::get(url("/api/bookings")).with_method(Method::POST),
      Request::get(url("/assets/logo.png"))
        .with_method(Method::PUT)
        .with_destination(Destination::Image),
      Request::navigate(url("/contact")).with_method(Method::POST),
      Request::get(url("/upload")).with_method(Method::DELETE),
    ];
    for request in requests {
      let response = router.handle(request).await.unwrap();
      assert_eq!(response.status, 200);
    }

    for namespace in router.storage().namespaces().unwrap() {
      assert!(router.storage().keys(&namespace).unwrap().is_empty());
    }
  }

  #[tokio::test]
  async fn test_failed_api_write_is_queued_for_sync() {
    let (router, network) = router();
    network.set_offline(true);

    let request = Request::get(url("/api/bookings"))
      .with_method(Method::POST)
      .with_body(r#"{"spot":4}"#);
    let response = router.handle(request).await.unwrap();
    assert_eq!(response.status, 503);

    let pending = router.storage().pending("background-sync").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].url, full("/api/bookings"));
  }

  #[tokio::test]
  async fn test_sync_queueing_can_be_disabled() {
    let (router, network) = router();
    let router = router.with_sync(SyncConfig {
      queue_failed_writes: false,
      ..SyncConfig::default()
    });
    network.set_offline(true);

    let request = Request::get(url("/api/bookings")).with_method(Method::POST);
    router.handle(request).await.unwrap();
    assert!(router.storage().pending("background-sync").unwrap().is_empty());
  }

  // ---------------------------------------------------------------------------
  // Static assets
  // ---------------------------------------------------------------------------

  #[tokio::test]
  async fn test_static_hit_skips_network() {
    let (router, network) = router();
    router
      .storage()
      .put(&static_ns(&router), &RequestKey::get(&url("/logo.png")), &Response::new(200, "png"))
      .unwrap();

    let request = Request::get(url("/logo.png")).with_destination(Destination::Image);
    let response = router.handle(request).await.unwrap();

    assert_eq!(response.text(), "png");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_static_miss_stores_into_static_namespace() {
    let (router, network) = router();
    network.respond(&full("/app.css"), Response::new(200, "body{}"));

    let request = Request::get(url("/app.css")).with_destination(Destination::Style);
    router.handle(request).await.unwrap();

    let hit = router
      .storage()
      .lookup(&static_ns(&router), &RequestKey::get(&url("/app.css")))
      .unwrap();
    assert_eq!(hit.unwrap().response.text(), "body{}");
  }

  #[tokio::test]
  async fn test_static_offline_synthesizes_text_503() {
    let (router, network) = router();
    network.set_offline(true);

    let request = Request::get(url("/app.js")).with_destination(Destination::Script);
    let response = router.handle(request).await.unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
  }

  // ---------------------------------------------------------------------------
  // Navigation
  // ---------------------------------------------------------------------------

  #[tokio::test]
  async fn test_navigation_prefers_network() {
    let (router, network) = router();
    router
      .storage()
      .put(&static_ns(&router), &RequestKey::get(&url("/")), &Response::new(200, "cached"))
      .unwrap();
    network.respond(&full("/about"), Response::new(200, "live"));

    let response = router.handle(Request::navigate(url("/about"))).await.unwrap();
    assert_eq!(response.text(), "live");

    let stored = router
      .storage()
      .lookup(&static_ns(&router), &RequestKey::get(&url("/about")))
      .unwrap();
    assert_eq!(stored.unwrap().response.text(), "live");
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_root_document_verbatim() {
    let (router, network) = router();
    let root = Response::new(200, "<html>app</html>").with_header("Content-Type", "text/html");
    router
      .storage()
      .put(&static_ns(&router), &RequestKey::get(&url("/")), &root)
      .unwrap();
    network.set_offline(true);

    let response = router.handle(Request::navigate(url("/login"))).await.unwrap();
    assert_eq!(response, root);
  }

  #[tokio::test]
  async fn test_navigation_offline_without_root_is_text_503() {
    let (router, network) = router();
    network.set_offline(true);

    let response = router.handle(Request::navigate(url("/login"))).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
  }

  // ---------------------------------------------------------------------------
  // Other
  // ---------------------------------------------------------------------------

  #[tokio::test]
  async fn test_other_success_is_not_stored() {
    let (router, network) = router();
    network.respond(&full("/fonts/a.woff2"), Response::new(200, "font"));

    let request = Request::get(url("/fonts/a.woff2")).with_destination(Destination::Font);
    let response = router.handle(request).await.unwrap();

    assert_eq!(response.text(), "font");
    for namespace in router.storage().namespaces().unwrap() {
      assert!(router.storage().keys(&namespace).unwrap().is_empty());
    }
  }

  #[tokio::test]
  async fn test_other_offline_falls_back_to_any_namespace() {
    let (router, network) = router();
    router
      .storage()
      .put(&static_ns(&router), &RequestKey::get(&url("/manifest.json")), &Response::new(200, "{}"))
      .unwrap();
    network.set_offline(true);

    let response = router.handle(Request::get(url("/manifest.json"))).await.unwrap();
    assert_eq!(response.text(), "{}");
  }

  #[tokio::test]
  async fn test_other_offline_without_cache_propagates_error() {
    let (router, network) = router();
    network.set_offline(true);

    assert!(router.handle(Request::get(url("/robots.txt"))).await.is_err());
  }

  /// Store whose reads always fail
  struct UnreadableStorage(MemoryStorage);

  impl CacheStorage for UnreadableStorage {
    fn open_namespace(&self, name: &str) -> Result<()> {
      self.0.open_namespace(name)
    }

    fn namespaces(&self) -> Result<Vec<String>> {
      self.0.namespaces()
    }

    fn delete_namespace(&self, name: &str) -> Result<bool> {
      self.0.delete_namespace(name)
    }

    fn lookup(&self, _namespace: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
      Err(eyre!("disk I/O error"))
    }

    fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
      self.0.put(namespace, key, response)
    }

    fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
      self.0.delete(namespace, key)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
      self.0.keys(namespace)
    }
  }

  impl SyncQueue for UnreadableStorage {
    fn enqueue(&self, tag: &str, request: &Request) -> Result<i64> {
      self.0.enqueue(tag, request)
    }

    fn pending(&self, tag: &str) -> Result<Vec<SyncItem>> {
      self.0.pending(tag)
    }

    fn remove(&self, id: i64) -> Result<bool> {
      self.0.remove(id)
    }

    fn record_failure(&self, id: i64) -> Result<()> {
      self.0.record_failure(id)
    }
  }

  #[tokio::test]
  async fn test_unreadable_store_counts_as_miss() {
    let network = Arc::new(ScriptedNetwork::new());
    let storage = UnreadableStorage(MemoryStorage::new());
    storage
      .put("parking-static-v1", &RequestKey::get(&url("/robots.txt")), &Response::new(200, "x"))
      .unwrap();
    let router = CacheRouter::new(
      storage,
      Arc::clone(&network),
      Url::parse(ORIGIN).unwrap(),
      RouterConfig::default(),
    );
    network.set_offline(true);

    // The network error comes back, not the storage error
    let err = router
      .handle(Request::get(url("/robots.txt")))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("network unreachable"));

    let response = router.handle(Request::get(url("/api/spots"))).await.unwrap();
    assert_eq!(response.status, 503);
  }

  // ---------------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------------

  #[tokio::test]
  async fn test_install_precaches_critical_resources() {
    let (router, network) = router();
    network.respond(&full("/"), Response::new(200, "root"));
    network.respond(&full("/index.html"), Response::new(200, "index"));

    router.install().await.unwrap();

    let keys = router.storage().keys(&static_ns(&router)).unwrap();
    assert_eq!(keys.len(), 2);
    assert!(router
      .storage()
      .namespaces()
      .unwrap()
      .contains(&api_ns(&router)));
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (router, network) = router();
    network.respond(&full("/"), Response::new(200, "root"));
    network.respond(&full("/index.html"), Response::new(404, "missing"));

    assert!(router.install().await.is_err());
    assert!(router.storage().keys(&static_ns(&router)).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_fails_on_transport_error() {
    let (router, network) = router();
    network.respond(&full("/"), Response::new(200, "root"));

    assert!(router.install().await.is_err());
    assert!(router.storage().keys(&static_ns(&router)).unwrap().is_empty());
  }

  #[test]
  fn test_activate_prunes_to_current_version() {
    let (router, _network) = router();
    let storage = router.storage();
    for name in ["parking-static-v0", "parking-api-v0", "something-else"] {
      storage.put(name, &RequestKey::get(&url("/")), &Response::new(200, "")).unwrap();
    }
    storage.open_namespace(&static_ns(&router)).unwrap();
    storage.open_namespace(&api_ns(&router)).unwrap();

    let removed = router.activate().unwrap();
    assert_eq!(
      removed,
      vec!["parking-static-v0", "parking-api-v0", "something-else"]
    );
    assert_eq!(
      storage.namespaces().unwrap(),
      vec![static_ns(&router), api_ns(&router)]
    );

    // Second activation has nothing left to do
    assert!(router.activate().unwrap().is_empty());
  }
}
