mod cache;
mod config;
mod control;
mod event;
mod net;
mod push;
mod router;
mod serve;
mod sync;
mod worker;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{CacheStorage, MemoryStorage, RequestKey, SqliteStorage};
use config::Config;
use control::ControlMessage;
use net::{Destination, HttpNetwork, Request};
use router::CacheRouter;
use sync::SyncQueue;
use worker::{ServiceWorker, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "cache-router")]
#[command(about = "Offline-first HTTP cache router with versioned cache namespaces")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cache-router/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to resolve resource paths against
  #[arg(long)]
  origin: Option<Url>,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the critical resources
  Install,
  /// Delete cache namespaces from other versions
  Activate,
  /// Route one request through the cache
  Fetch {
    /// Absolute URL, or a path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Declared destination (document, image, style, script, font, empty)
    #[arg(short = 'D', long, default_value = "empty")]
    destination: String,
    /// Treat as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Request body
    #[arg(short = 'd', long)]
    data: Option<String>,
    /// Extra header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Print status and headers before the body
    #[arg(short, long)]
    include: bool,
  },
  /// Replay queued background-sync requests
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Compose the notification for a push payload
  Push { payload: Option<String> },
  /// Send a control message
  Message { opcode: Opcode },
  /// Resolve a notification click (no action means the body was clicked)
  Click { action: Option<String> },
  /// List cache namespaces
  Namespaces,
  /// List the keys stored in a namespace
  Keys { namespace: String },
  /// Remove one cached response
  Evict {
    namespace: String,
    url: Url,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List requests waiting for background sync
  Queue {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Read JSON events from stdin, one per line
  Serve,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Opcode {
  SkipWaiting,
  GetVersion,
}

impl From<Opcode> for ControlMessage {
  fn from(opcode: Opcode) -> Self {
    match opcode {
      Opcode::SkipWaiting => ControlMessage::SkipWaiting,
      Opcode::GetVersion => ControlMessage::GetVersion,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config {
      origin: Some(origin),
      ..config
    }
  } else {
    config
  };

  let _guard = init_tracing(args.verbose, config.log_file.as_deref())?;

  if config.persist {
    let storage = SqliteStorage::open(config.database.as_deref())?;
    run(storage, config, args.command).await
  } else {
    run(MemoryStorage::new(), config, args.command).await
  }
}

/// Set up logging to stderr, or to `log_file` when configured.
fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    1 => EnvFilter::new("info"),
    2 => EnvFilter::new("debug"),
    _ => EnvFilter::new("trace"),
  };

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_level(true);

  match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      builder.with_writer(writer).with_ansi(false).init();
      Ok(Some(guard))
    }
    None => {
      builder.with_writer(std::io::stderr).init();
      Ok(None)
    }
  }
}

async fn run<S>(storage: S, config: Config, command: Command) -> Result<()>
where
  S: CacheStorage + SyncQueue + 'static,
{
  // Commands that only inspect the store don't need an origin
  match command {
    Command::Namespaces => {
      for name in storage.namespaces()? {
        println!("{}\t{}", name, storage.keys(&name)?.len());
      }
      Ok(())
    }
    Command::Keys { namespace } => {
      for key in storage.keys(&namespace)? {
        match storage.lookup(&namespace, &key)? {
          Some(cached) => println!(
            "{}\t{}\t{}",
            cached.cached_at.format("%Y-%m-%d %H:%M:%S"),
            cached.response.status,
            key
          ),
          None => println!("-\t-\t{}", key),
        }
      }
      Ok(())
    }
    Command::Evict {
      namespace,
      url,
      method,
    } => {
      let key = RequestKey::new(&method, &url);
      if storage.delete(&namespace, &key)? {
        println!("evicted {}", key);
      } else {
        println!("not cached: {}", key);
      }
      Ok(())
    }
    Command::Queue { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      for item in storage.pending(&tag)? {
        println!(
          "{}\t{}\t{}\t{} {}",
          item.id,
          item.queued_at.format("%Y-%m-%d %H:%M:%S"),
          item.attempts,
          item.method,
          item.url
        );
      }
      Ok(())
    }
    command => run_worker(storage, config, command).await,
  }
}

async fn run_worker<S>(storage: S, config: Config, command: Command) -> Result<()>
where
  S: CacheStorage + SyncQueue + 'static,
{
  let origin = config.origin()?;
  let network = HttpNetwork::new()?;
  let router = CacheRouter::new(storage, network, origin.clone(), config.cache.clone())
    .with_sync(config.sync.clone());
  let worker =
    ServiceWorker::restore(router, config.push.clone())?.with_skip_waiting(config.skip_waiting);

  match command {
    Command::Install => {
      let state = worker.install().await?;
      let cached = worker
        .router()
        .storage()
        .keys(&config.cache.static_namespace)?
        .len();
      println!("{} ({} resources cached)", state, cached);
    }
    Command::Activate => {
      if worker.state()? == WorkerState::Active {
        println!("already active");
      } else {
        for name in worker.activate()? {
          println!("deleted {}", name);
        }
      }
    }
    Command::Fetch {
      url,
      method,
      destination,
      navigate,
      data,
      headers,
      include,
    } => {
      let request = build_request(&origin, &url, &method, &destination, navigate, data, &headers)?;
      let response = worker.fetch(request).await?;

      if include {
        println!("{}", response.status);
        for (name, value) in &response.headers {
          println!("{}: {}", name, value);
        }
        println!();
      }
      println!("{}", response.text());
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      let report = worker.sync(&tag).await?;
      println!("{}", serde_json::to_string(&report)?);
    }
    Command::Push { payload } => {
      let notification = worker.push(payload.as_deref());
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Message { opcode } => {
      let reply = worker.message(opcode.into())?;
      println!("{}", serde_json::to_string(&reply)?);
    }
    Command::Click { action } => {
      let target = worker.notification_click(action.as_deref());
      println!("{}", serde_json::to_string(&target)?);
    }
    Command::Serve => {
      let (events, handler) = event::channel();
      let worker = Arc::new(worker);
      let event_loop = tokio::spawn(handler.run(worker));

      serve::serve_stdio(events, origin, config.sync.tag.clone()).await?;
      event_loop
        .await
        .map_err(|e| eyre!("Event loop failed: {}", e))?;
    }
    Command::Namespaces | Command::Keys { .. } | Command::Evict { .. } | Command::Queue { .. } => {}
  }

  Ok(())
}

fn build_request(
  origin: &Url,
  url: &str,
  method: &str,
  destination: &str,
  navigate: bool,
  data: Option<String>,
  headers: &[String],
) -> Result<Request> {
  let url = origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
  let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url).with_destination(destination.parse::<Destination>()?)
  }
  .with_method(method);

  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(data) = data {
    request = request.with_body(data);
  }

  Ok(request)
}
