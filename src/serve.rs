//! Line-delimited JSON front end for the event loop.
//!
//! Each stdin line is one event, e.g.
//! `{"id": 1, "event": "fetch", "url": "/api/spots", "destination": "empty"}`.
//! Each stdout line is the reply, tagged with the same `id`.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;
use url::Url;

use crate::control::ControlMessage;
use crate::event::EventSender;
use crate::net::{Destination, Request, RequestMode, Response};

#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(default)]
  id: Option<Value>,
  #[serde(flatten)]
  event: Inbound,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Inbound {
  Install,
  Activate,
  Fetch(FetchSpec),
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  Message {
    data: ControlMessage,
  },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
  },
}

#[derive(Debug, Deserialize)]
struct FetchSpec {
  /// Absolute, or relative to the origin
  url: String,
  #[serde(default)]
  method: Option<String>,
  #[serde(default)]
  destination: Destination,
  #[serde(default)]
  mode: RequestMode,
  #[serde(default)]
  headers: Vec<(String, String)>,
  #[serde(default)]
  body: Option<String>,
}

impl FetchSpec {
  fn into_request(self, origin: &Url) -> Result<Request> {
    let url = origin
      .join(&self.url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", self.url, e))?;
    let method = match self.method {
      Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", m, e))?,
      None => Method::GET,
    };

    Ok(Request {
      method,
      url,
      destination: self.destination,
      mode: self.mode,
      headers: self.headers,
      body: self.body.map(String::into_bytes).unwrap_or_default(),
    })
  }
}

#[derive(Debug, Serialize)]
struct FetchReply {
  status: u16,
  headers: Vec<(String, String)>,
  body: String,
}

impl From<Response> for FetchReply {
  fn from(response: Response) -> Self {
    Self {
      status: response.status,
      body: response.text(),
      headers: response.headers,
    }
  }
}

/// Feed stdin lines into the event loop until EOF, writing replies to stdout.
///
/// Fetch lines are handled concurrently; every other event is sent in line
/// order and awaited before the next line is read.
pub async fn serve_stdio(events: EventSender, origin: Url, default_tag: String) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = out_rx.recv().await {
      stdout.write_all(line.as_bytes()).await?;
      stdout.write_all(b"\n").await?;
      stdout.flush().await?;
    }
    Ok::<_, std::io::Error>(())
  });

  let mut fetches = JoinSet::new();
  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read stdin: {}", e))?
  {
    if line.trim().is_empty() {
      continue;
    }

    let is_fetch = serde_json::from_str::<Value>(&line)
      .map(|v| v.get("event").and_then(Value::as_str) == Some("fetch"))
      .unwrap_or(false);

    if is_fetch {
      let events = events.clone();
      let origin = origin.clone();
      let default_tag = default_tag.clone();
      let out = out_tx.clone();
      fetches.spawn(async move {
        let reply = handle_line(&events, &origin, &default_tag, &line).await;
        let _ = out.send(reply.to_string());
      });
    } else {
      let reply = handle_line(&events, &origin, &default_tag, &line).await;
      let _ = out_tx.send(reply.to_string());
    }
  }

  while fetches.join_next().await.is_some() {}
  debug!("stdin closed, shutting down");
  drop(out_tx);

  writer
    .await
    .map_err(|e| eyre!("Output task failed: {}", e))?
    .map_err(|e| eyre!("Failed to write stdout: {}", e))?;
  Ok(())
}

/// Turn one input line into one reply object. Never fails; errors become
/// `{"ok": false, "error": ...}`.
async fn handle_line(events: &EventSender, origin: &Url, default_tag: &str, line: &str) -> Value {
  let envelope: Envelope = match serde_json::from_str(line) {
    Ok(envelope) => envelope,
    Err(e) => {
      return json!({ "id": Value::Null, "ok": false, "error": format!("Invalid event: {}", e) })
    }
  };

  let id = envelope.id.unwrap_or(Value::Null);
  match dispatch(events, origin, default_tag, envelope.event).await {
    Ok(result) => json!({ "id": id, "ok": true, "result": result }),
    Err(e) => json!({ "id": id, "ok": false, "error": format!("{:#}", e) }),
  }
}

async fn dispatch(
  events: &EventSender,
  origin: &Url,
  default_tag: &str,
  event: Inbound,
) -> Result<Value> {
  let value = match event {
    Inbound::Install => serde_json::to_value(events.install().await?)?,
    Inbound::Activate => json!({ "removed": events.activate().await? }),
    Inbound::Fetch(spec) => {
      let request = spec.into_request(origin)?;
      serde_json::to_value(FetchReply::from(events.fetch(request).await?))?
    }
    Inbound::Sync { tag } => {
      let tag = tag.as_deref().unwrap_or(default_tag);
      serde_json::to_value(events.sync(tag).await?)?
    }
    Inbound::Push { payload } => serde_json::to_value(events.push(payload).await?)?,
    Inbound::Message { data } => serde_json::to_value(events.message(data).await?)?,
    Inbound::NotificationClick { action } => {
      serde_json::to_value(events.notification_click(action).await?)?
    }
  };
  Ok(value)
}
