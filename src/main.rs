use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use rancho::config::Config;
use rancho::control::Command as ControlCommand;
use rancho::http::{Destination, HttpTransport, Request};
use rancho::store::{MutationAction, ResourceType, Store};
use rancho::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "rancho")]
#[command(about = "Offline-first sync engine for the rancho admin app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rancho/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Send a request through the offline dispatcher
  Fetch {
    /// Path under the app origin, or an absolute URL
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body (sent as JSON)
    #[arg(short, long)]
    data: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Record a mutation for later replay
  Save {
    resource: ResourceType,
    action: MutationAction,
    /// JSON payload
    payload: String,
    /// Item id for updates and deletes
    #[arg(long)]
    id: Option<String>,
  },
  /// Replay queued mutations now
  Sync,
  /// Show store and cache status
  Status,
  /// Remove every cached response
  ClearCache,
  /// Drop synced mutations and expired cache entries
  Gc,
  /// List dead-lettered queue entries
  DeadLetters {
    /// Put an entry back in the queue with its retries reset
    #[arg(long)]
    requeue: Option<i64>,
  },
  /// Send a raw control message, e.g. '{"type":"GET_CACHE_STATUS"}'
  Control { message: String },
  /// Keep running: precache, watch connectivity and sync on reconnect
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db_path = config.database_path()?;
  let _log_guard = init_logging(&db_path)?;

  let store = Arc::new(
    Store::open(&db_path).map_err(|e| eyre!("Failed to open {}: {}", db_path.display(), e))?,
  );
  let transport = Arc::new(HttpTransport::new(
    config.app_url()?,
    Config::get_api_token(),
    config.request_timeout(),
  )?);
  let engine = Engine::new(Arc::clone(&store), transport, config.engine_options()?);

  let result = run(&engine, &config, args.command).await;
  store.close()?;
  result
}

async fn run(engine: &Engine, config: &Config, command: Cmd) -> Result<()> {
  match command {
    Cmd::Fetch {
      target,
      method,
      data,
      navigate,
    } => {
      let url = resolve(config, &target)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        let destination = Destination::from_path(url.path());
        Request::new(&method, url).with_destination(destination)
      };
      if let Some(body) = data {
        request = request
          .with_header("content-type", "application/json")
          .with_body(body);
      }

      let response = engine.fetch(request).await;
      eprintln!("{} ({:?})", response.status, response.source);
      println!("{}", response.text());
    }
    Cmd::Save {
      resource,
      action,
      payload,
      id,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let queued = engine.save_offline(resource, action, &payload, id.as_deref())?;
      println!(
        "queued as entry {} (mutation {})",
        queued.queue_id,
        queued
          .mutation_id
          .map(|id| id.to_string())
          .unwrap_or_else(|| "-".into())
      );
    }
    Cmd::Sync => match engine.sync().await {
      Ok(outcomes) => println!("{}", serde_json::to_string_pretty(&outcomes)?),
      Err(e) if e.is_transient() => println!("sync skipped: {}", e),
      Err(e) => return Err(e.into()),
    },
    Cmd::Status => {
      let stats = engine.service().refresh_counts()?;
      let cache = engine.service().cache_status()?;
      println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
          "store": stats,
          "cache": cache,
          "connection": engine.service().status(),
        }))?
      );
    }
    Cmd::ClearCache => {
      engine.start_control().clear_cache().await?;
      println!("cache cleared");
    }
    Cmd::Gc => {
      let report = engine.collect_garbage()?;
      println!(
        "removed {} synced mutations, {} expired cache entries",
        report.synced_mutations, report.expired_cache_entries
      );
    }
    Cmd::DeadLetters { requeue } => {
      if let Some(id) = requeue {
        if !engine.store().requeue(id)? {
          return Err(eyre!("No dead-lettered entry with id {}", id));
        }
        println!("entry {} requeued", id);
      } else {
        let entries = engine.store().list_dead_letters()?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
      }
    }
    Cmd::Control { message } => {
      let command = ControlCommand::from_json(&message)
        .map_err(|e| eyre!("Unrecognized control message: {}", e))?;
      let handle = engine.start_control();
      match handle.send(command).await? {
        Some(reply) => println!("{}", reply.to_json()?),
        None => println!("ok"),
      }
    }
    Cmd::Watch => watch(engine).await?,
  }

  Ok(())
}

async fn watch(engine: &Engine) -> Result<()> {
  let cached = engine.install_and_activate().await?;
  tracing::info!(cached, "precache complete");

  let control = engine.start_control();
  let monitor = engine.start_monitor();
  let mut status = control.subscribe();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let current = status.borrow_and_update().clone();
        println!("{}", serde_json::to_string(&current)?);
      }
    }
  }

  monitor.shutdown().await;
  Ok(())
}

fn resolve(config: &Config, target: &str) -> Result<Url> {
  if target.starts_with("http://") || target.starts_with("https://") {
    return Url::parse(target).map_err(|e| eyre!("Invalid URL '{}': {}", target, e));
  }
  config
    .app_url()?
    .join(target)
    .map_err(|e| eyre!("Invalid path '{}': {}", target, e))
}

/// Log to a daily file next to the database; stdout is reserved for output.
fn init_logging(db_path: &Path) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "rancho.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("RANCHO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
