//! Worker lifecycle: install, wait, activate, serve.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::PushConfig;
use crate::control::{ControlMessage, ControlReply};
use crate::net::{Network, Request, Response};
use crate::push::{self, ClickTarget, Notification};
use crate::router::CacheRouter;
use crate::sync::{self, SyncQueue, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Not installed yet
  Parsed,
  Installing,
  /// Installed, old namespaces still present
  Waiting,
  Activating,
  /// Controls requests
  Active,
  /// Install failed
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// The cache router plus its lifecycle, sync and push handling.
pub struct ServiceWorker<S, N> {
  router: CacheRouter<S, N>,
  push: PushConfig,
  skip_waiting: AtomicBool,
  state: Mutex<WorkerState>,
}

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + SyncQueue + 'static,
  N: Network,
{
  pub fn new(router: CacheRouter<S, N>, push: PushConfig) -> Self {
    Self {
      router,
      push,
      skip_waiting: AtomicBool::new(false),
      state: Mutex::new(WorkerState::Parsed),
    }
  }

  /// Pick up where a previous run left off, judging from the store.
  ///
  /// A populated static namespace means the worker was installed; it is
  /// active unless namespaces from another version are still around.
  pub fn restore(router: CacheRouter<S, N>, push: PushConfig) -> Result<Self> {
    let config = router.config();
    let storage = router.storage();
    let namespaces = storage.namespaces()?;

    let state = if storage.keys(&config.static_namespace)?.is_empty() {
      WorkerState::Parsed
    } else if namespaces
      .iter()
      .any(|name| !config.allowed_namespaces().contains(&name.as_str()))
    {
      WorkerState::Waiting
    } else {
      WorkerState::Active
    };
    debug!(%state, "Restored worker state");

    let worker = Self::new(router, push);
    *worker.lock()? = state;
    Ok(worker)
  }

  /// Activate straight after install instead of waiting.
  pub fn with_skip_waiting(self, skip_waiting: bool) -> Self {
    self.skip_waiting.store(skip_waiting, Ordering::SeqCst);
    self
  }

  pub fn router(&self) -> &CacheRouter<S, N> {
    &self.router
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(*self.lock()?)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, WorkerState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    let mut current = self.lock()?;
    if *current != state {
      info!(from = %*current, to = %state, "Worker state changed");
      *current = state;
    }
    Ok(())
  }

  /// Run the install step. Returns the state the worker ends up in.
  ///
  /// Installing an active worker refreshes the critical resources and
  /// leaves it active; a failed refresh keeps the existing cache.
  pub async fn install(&self) -> Result<WorkerState> {
    let state = self.state()?;
    match state {
      WorkerState::Installing | WorkerState::Activating => {
        return Err(eyre!("Cannot install while worker is {}", state));
      }
      WorkerState::Active => {
        self.router.install().await?;
        info!("Re-cached critical resources, worker stays active");
        return Ok(state);
      }
      _ => {}
    }

    self.set_state(WorkerState::Installing)?;
    if let Err(e) = self.router.install().await {
      self.set_state(WorkerState::Redundant)?;
      return Err(e);
    }
    self.set_state(WorkerState::Waiting)?;

    if self.skip_waiting.load(Ordering::SeqCst) {
      self.activate()?;
    }
    self.state()
  }

  /// Run the version cutover. Returns the deleted namespaces.
  pub fn activate(&self) -> Result<Vec<String>> {
    let state = self.state()?;
    if state != WorkerState::Waiting {
      return Err(eyre!("Cannot activate worker in state {}", state));
    }

    self.set_state(WorkerState::Activating)?;
    match self.router.activate() {
      Ok(removed) => {
        self.set_state(WorkerState::Active)?;
        Ok(removed)
      }
      Err(e) => {
        self.set_state(WorkerState::Waiting)?;
        Err(e)
      }
    }
  }

  /// Handle an intercepted request.
  ///
  /// Until the worker is active it does not control requests, which go
  /// straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    if self.state()? != WorkerState::Active {
      debug!(%request, "Worker not active, passing request through");
      return self.router.network().fetch(&request).await;
    }
    self.router.handle(request).await
  }

  /// Replay the background-sync queue for `tag`.
  pub async fn sync(&self, tag: &str) -> Result<SyncReport> {
    sync::drain(self.router.storage(), self.router.network(), tag).await
  }

  /// Compose the notification for an inbound push.
  pub fn push(&self, payload: Option<&str>) -> Notification {
    push::compose(&self.push, payload)
  }

  /// Resolve a click on a shown notification.
  pub fn notification_click(&self, action: Option<&str>) -> ClickTarget {
    Notification::click_target(self.router.origin(), action)
  }

  /// Handle a control message from the hosting page.
  pub fn message(&self, message: ControlMessage) -> Result<ControlReply> {
    match message {
      ControlMessage::GetVersion => Ok(ControlReply::Version {
        version: self.router.config().static_namespace.clone(),
      }),
      ControlMessage::SkipWaiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        match self.state()? {
          WorkerState::Waiting => Ok(ControlReply::Activated {
            removed: self.activate()?,
          }),
          WorkerState::Active => Ok(ControlReply::Activated {
            removed: Vec::new(),
          }),
          state => {
            warn!(%state, "Skip-waiting requested before install finished");
            Ok(ControlReply::Deferred { state })
          }
        }
      }
    }
  }
}
