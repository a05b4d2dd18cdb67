//! Background sync: replay requests that failed while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::net::{Destination, Network, Request, RequestMode};

/// Sync tag used when none is given.
pub const DEFAULT_SYNC_TAG: &str = "background-sync";

/// A request waiting to be replayed.
#[derive(Debug, Clone)]
pub struct SyncItem {
  pub id: i64,
  pub tag: String,
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub queued_at: DateTime<Utc>,
}

impl SyncItem {
  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}' in sync item {}: {}", self.method, self.id, e))?;
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Invalid URL '{}' in sync item {}: {}", self.url, self.id, e))?;

    Ok(Request {
      method,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

/// Persistent queue of requests awaiting replay, grouped by tag.
pub trait SyncQueue: Send + Sync {
  /// Append a request. Returns its queue id.
  fn enqueue(&self, tag: &str, request: &Request) -> Result<i64>;

  /// Items queued under `tag`, oldest first.
  fn pending(&self, tag: &str) -> Result<Vec<SyncItem>>;

  /// Drop an item. Returns whether it was present.
  fn remove(&self, id: i64) -> Result<bool>;

  /// Bump the failed-attempt counter of an item.
  fn record_failure(&self, id: i64) -> Result<()>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub remaining: usize,
}

/// Replay every item queued under `tag`.
///
/// Items are replayed concurrently and independently. An item leaves the
/// queue only when its replay gets a 2xx response; any other outcome keeps
/// it queued and is logged, without affecting the other items.
pub async fn drain<Q, N>(queue: &Q, network: &N, tag: &str) -> Result<SyncReport>
where
  Q: SyncQueue + ?Sized,
  N: Network,
{
  let items = queue.pending(tag)?;
  if items.is_empty() {
    debug!(tag, "Sync queue empty");
    return Ok(SyncReport::default());
  }

  let replays = items.iter().map(|item| async move {
    let outcome = match item.to_request() {
      Ok(request) => network.fetch(&request).await,
      Err(e) => Err(e),
    };
    (item, outcome)
  });

  let mut report = SyncReport {
    attempted: items.len(),
    ..SyncReport::default()
  };

  for (item, outcome) in join_all(replays).await {
    match outcome {
      Ok(response) if response.ok() => match queue.remove(item.id) {
        Ok(_) => report.succeeded += 1,
        Err(e) => warn!(
          id = item.id,
          url = %item.url,
          error = %e,
          "Failed to remove replayed item from sync queue"
        ),
      },
      Ok(response) => {
        warn!(
          id = item.id,
          url = %item.url,
          status = response.status,
          "Sync replay rejected, keeping item queued"
        );
        mark_failed(queue, item);
      }
      Err(e) => {
        warn!(id = item.id, url = %item.url, error = %e, "Sync replay failed, keeping item queued");
        mark_failed(queue, item);
      }
    }
  }

  report.remaining = report.attempted - report.succeeded;
  info!(
    tag,
    attempted = report.attempted,
    succeeded = report.succeeded,
    remaining = report.remaining,
    "Background sync finished"
  );

  Ok(report)
}

fn mark_failed<Q: SyncQueue + ?Sized>(queue: &Q, item: &SyncItem) {
  if let Err(e) = queue.record_failure(item.id) {
    warn!(id = item.id, error = %e, "Failed to record sync attempt");
  }
}
