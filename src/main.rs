use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use livesync::config::Config;
use livesync::{
  ChannelBridge, FetchOrchestrator, HttpPageSource, SyncEvent, SyncLoop,
};

#[derive(Parser, Debug)]
#[command(name = "livesync")]
#[command(about = "Keep a paginated collection in sync and print what changes")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/livesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Page to follow
  #[arg(long)]
  page: Option<u32>,

  /// Page size
  #[arg(long)]
  limit: Option<u32>,

  /// Only follow items with this status
  #[arg(long)]
  status: Option<String>,

  /// Fetch once, print the page as JSON and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(page) = args.page {
    config.query.page = page;
  }
  if let Some(limit) = args.limit {
    config.query.limit = limit;
  }
  if let Some(status) = args.status {
    config.query.filters.status = Some(status);
  }

  let _log_guard = livesync::logging::init(&config.logging)?;

  let source = HttpPageSource::new(&config.endpoint)?;
  let orchestrator = Arc::new(FetchOrchestrator::new(
    source,
    config.cache.ttl(),
    (&config.backoff).into(),
  ));

  if args.once {
    let fetched = orchestrator
      .fetch(&config.query)
      .await
      .map_err(|e| eyre!("Fetch failed: {}", e))?;
    println!("{}", serde_json::to_string_pretty(&fetched.data)?);
    return Ok(());
  }

  let bridge = ChannelBridge::from_config(&config.realtime);
  if !bridge.is_enabled() {
    tracing::info!("realtime channel disabled, relying on timer polling");
  }
  let (handle, mut events) = SyncLoop::spawn(
    orchestrator,
    config.query.clone(),
    config.sync_options(),
    &bridge,
  );

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Some(event) => print_event(event),
        None => break,
      },
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("interrupted, shutting down");
        break;
      }
    }
  }

  handle.shutdown().await;
  Ok(())
}

fn print_event(event: SyncEvent) {
  match event {
    SyncEvent::Created(items) => {
      for item in &items {
        println!("+ {} {}", item.id, serde_json::Value::Object(item.fields.clone()));
      }
    }
    SyncEvent::Updated(items) => {
      for item in &items {
        println!("~ {} {}", item.id, serde_json::Value::Object(item.fields.clone()));
      }
    }
    SyncEvent::ConnectionChanged(true) => println!("* connected"),
    SyncEvent::ConnectionChanged(false) => println!("* disconnected"),
    SyncEvent::Advisory(advisory) => eprintln!("! {}", advisory.message()),
    SyncEvent::PollingSuspended { resume_in } => {
      println!("* polling paused for {}s", resume_in.as_secs())
    }
    SyncEvent::PollingResumed => println!("* polling resumed"),
  }
}
