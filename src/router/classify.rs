use serde::Serialize;
use std::fmt;

use crate::net::Request;

/// Which serving strategy a request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
  /// Under an API prefix: cache-first with background refresh
  Api,
  /// Image, style or script: cache-first
  StaticAsset,
  /// Top-level document load: network-first with root-document fallback
  Navigation,
  /// Everything else: network-first, errors propagate
  Other,
}

impl fmt::Display for RequestClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Api => "api",
      Self::StaticAsset => "static",
      Self::Navigation => "navigation",
      Self::Other => "other",
    };
    f.write_str(name)
  }
}

/// Classify a request by URL path prefix, then destination, then mode.
pub fn classify(request: &Request, api_prefixes: &[String]) -> RequestClass {
  let path = request.url.path();

  if api_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
    RequestClass::Api
  } else if request.destination.is_static_asset() {
    RequestClass::StaticAsset
  } else if request.is_navigation() {
    RequestClass::Navigation
  } else {
    RequestClass::Other
  }
}
