use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::CacheStorage;
use crate::control::{ControlMessage, ControlReply};
use crate::net::{Network, Request, Response};
use crate::push::{ClickTarget, Notification};
use crate::sync::{SyncQueue, SyncReport};
use crate::worker::{ServiceWorker, WorkerState};

/// Worker events, each carrying the channel its reply goes to
#[derive(Debug)]
pub enum Event {
  Install {
    reply: oneshot::Sender<Result<WorkerState>>,
  },
  Activate {
    reply: oneshot::Sender<Result<Vec<String>>>,
  },
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
  },
  Sync {
    tag: String,
    reply: oneshot::Sender<Result<SyncReport>>,
  },
  Push {
    payload: Option<String>,
    reply: oneshot::Sender<Notification>,
  },
  Message {
    message: ControlMessage,
    reply: oneshot::Sender<Result<ControlReply>>,
  },
  NotificationClick {
    action: Option<String>,
    reply: oneshot::Sender<ClickTarget>,
  },
}

/// Receiving end of the worker's event queue
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

/// Sending end of the worker's event queue
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Event>,
}

/// Create a connected sender/handler pair.
///
/// The handler's queue closes once every sender is dropped.
pub fn channel() -> (EventSender, EventHandler) {
  let (tx, rx) = mpsc::unbounded_channel();
  (EventSender { tx }, EventHandler { rx })
}

impl EventHandler {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Dispatch events to `worker` until every sender is gone.
  ///
  /// Lifecycle, sync, push and control events run to completion one at a
  /// time, in arrival order. Fetch events are spawned so independent
  /// requests don't wait on each other.
  pub async fn run<S, N>(mut self, worker: Arc<ServiceWorker<S, N>>)
  where
    S: CacheStorage + SyncQueue + 'static,
    N: Network,
  {
    while let Some(event) = self.next().await {
      match event {
        Event::Install { reply } => {
          let _ = reply.send(worker.install().await);
        }
        Event::Activate { reply } => {
          let _ = reply.send(worker.activate());
        }
        Event::Fetch { request, reply } => {
          let worker = Arc::clone(&worker);
          tokio::spawn(async move {
            let _ = reply.send(worker.fetch(request).await);
          });
        }
        Event::Sync { tag, reply } => {
          let _ = reply.send(worker.sync(&tag).await);
        }
        Event::Push { payload, reply } => {
          let _ = reply.send(worker.push(payload.as_deref()));
        }
        Event::Message { message, reply } => {
          let _ = reply.send(worker.message(message));
        }
        Event::NotificationClick { action, reply } => {
          let _ = reply.send(worker.notification_click(action.as_deref()));
        }
      }
    }
    debug!("Event queue closed");
  }
}

impl EventSender {
  async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(make(reply))
      .map_err(|_| eyre!("Worker event loop has stopped"))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped the event without replying"))
  }

  pub async fn install(&self) -> Result<WorkerState> {
    self.request(|reply| Event::Install { reply }).await?
  }

  pub async fn activate(&self) -> Result<Vec<String>> {
    self.request(|reply| Event::Activate { reply }).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<Response> {
    self
      .request(|reply| Event::Fetch { request, reply })
      .await?
  }

  pub async fn sync(&self, tag: &str) -> Result<SyncReport> {
    let tag = tag.to_string();
    self.request(|reply| Event::Sync { tag, reply }).await?
  }

  pub async fn push(&self, payload: Option<String>) -> Result<Notification> {
    self.request(|reply| Event::Push { payload, reply }).await
  }

  pub async fn message(&self, message: ControlMessage) -> Result<ControlReply> {
    self
      .request(|reply| Event::Message { message, reply })
      .await?
  }

  pub async fn notification_click(&self, action: Option<String>) -> Result<ClickTarget> {
    self
      .request(|reply| Event::NotificationClick { action, reply })
      .await
  }
}
