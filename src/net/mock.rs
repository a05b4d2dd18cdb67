//! Scripted in-process network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::client::Network;
use super::types::{Request, Response};

/// Network fake that answers from a table of URL -> response.
///
/// Unknown URLs fail like an unreachable host. `set_offline(true)` makes
/// every fetch fail.
#[derive(Default)]
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
  offline: Mutex<bool>,
  delay: Option<Duration>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every fetch by `delay` before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    *self.offline.lock().unwrap() = offline;
  }

  /// Requests seen so far, as "METHOD url".
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.to_string());

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    if *self.offline.lock().unwrap() {
      return Err(eyre!("Failed to fetch {}: network unreachable", request));
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned()
      .ok_or_else(|| eyre!("Failed to fetch {}: connection refused", request))
  }
}
