use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "livesync=info";

/// Install the global subscriber: a daily rolling file, plus stderr when asked.
///
/// Keep the returned guard alive for the lifetime of the process or buffered
/// lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => default_directory()?,
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "livesync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr_layer = config
    .stderr
    .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn default_directory() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("livesync").join("logs"))
}
