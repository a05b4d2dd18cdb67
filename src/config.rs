use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::sync::DEFAULT_SYNC_TAG;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin that relative resource paths are resolved against
  pub origin: Option<Url>,
  /// Cache database path (defaults to $XDG_DATA_HOME/cache-router/cache.db)
  pub database: Option<PathBuf>,
  /// Keep caches in SQLite; when false everything lives in memory
  pub persist: bool,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
  /// Activate right after install instead of waiting
  pub skip_waiting: bool,
  pub cache: RouterConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      database: None,
      persist: true,
      log_file: None,
      skip_waiting: false,
      cache: RouterConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
    }
  }
}

/// Namespaces and routing tables for the cache router.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
  /// Namespace for pre-cached and static assets; doubles as the version tag
  pub static_namespace: String,
  /// Namespace for API responses
  pub api_namespace: String,
  /// Paths fetched into the static namespace at install
  pub critical_resources: Vec<String>,
  /// Path prefixes served with the API strategy
  pub api_prefixes: Vec<String>,
}

impl Default for RouterConfig {
  fn default() -> Self {
    Self {
      static_namespace: "parking-static-v1".to_string(),
      api_namespace: "parking-api-v1".to_string(),
      critical_resources: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
      ],
      api_prefixes: vec!["/api/".to_string()],
    }
  }
}

impl RouterConfig {
  /// Namespaces that survive a version cutover.
  pub fn allowed_namespaces(&self) -> [&str; 2] {
    [self.static_namespace.as_str(), self.api_namespace.as_str()]
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub tag: String,
  /// Queue non-GET API requests that fail at the transport level
  pub queue_failed_writes: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: DEFAULT_SYNC_TAG.to_string(),
      queue_failed_writes: true,
    }
  }
}

/// Defaults for push notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      title: "Parking Update".to_string(),
      body: "New parking update available".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cache-router.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cache-router/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cache-router.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cache-router").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.static_namespace == self.cache.api_namespace {
      return Err(eyre!(
        "static_namespace and api_namespace must differ (both are '{}')",
        self.cache.static_namespace
      ));
    }
    if let Some(prefix) = self.cache.api_prefixes.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("API prefix '{}' must start with '/'", prefix));
    }
    Ok(())
  }

  /// Resolve the origin from config, falling back to CACHE_ROUTER_ORIGIN.
  pub fn origin(&self) -> Result<Url> {
    if let Some(origin) = &self.origin {
      return Ok(origin.clone());
    }

    let value = std::env::var("CACHE_ROUTER_ORIGIN").map_err(|_| {
      eyre!("No origin configured. Set `origin` in the config file, pass --origin, or set CACHE_ROUTER_ORIGIN.")
    })?;
    Url::parse(&value).map_err(|e| eyre!("Invalid CACHE_ROUTER_ORIGIN '{}': {}", value, e))
  }
}
