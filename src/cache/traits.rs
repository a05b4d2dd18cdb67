//! Core traits and types for the cache store.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::{Request, Response};

/// Identity a response is stored under: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }

  /// Key for a GET of `url`.
  pub fn get(url: &url::Url) -> Self {
    Self::new("GET", url)
  }

  /// SHA256 of "METHOD url", used as the storage row key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response and when it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named namespaces, each mapping
/// `RequestKey -> Response`. Writes replace; the last writer for a key wins.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it doesn't exist yet.
  fn open_namespace(&self, name: &str) -> Result<()>;

  /// Names of all namespaces, oldest first.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and every entry in it. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Look up a stored response. Never writes.
  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, creating the namespace if needed.
  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool>;

  /// Keys stored in a namespace, in insertion order.
  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>>;

  /// Look up a key across every namespace, oldest namespace first.
  fn lookup_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    for namespace in self.namespaces()? {
      if let Some(hit) = self.lookup(&namespace, key)? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }
}
