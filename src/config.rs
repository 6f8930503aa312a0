use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::collection::PageRequest;
use crate::sync::SyncOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub endpoint: EndpointConfig,
  #[serde(default)]
  pub query: PageRequest,
  /// Item fields whose change counts as an update
  #[serde(default = "default_watched_fields")]
  pub watched_fields: Vec<String>,
  #[serde(default)]
  pub poll: PollConfig,
  #[serde(default)]
  pub backoff: BackoffConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

fn default_watched_fields() -> Vec<String> {
  vec!["status".into(), "amount".into(), "category".into()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
  pub url: String,
  pub timeout_ms: u64,
  /// Response header naming where the server got the data from
  pub data_source_header: String,
}

impl Default for EndpointConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      timeout_ms: 10_000,
      data_source_header: "x-data-source".into(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
  pub interval_ms: u64,
  pub jitter_ms: u64,
  pub debounce_ms: u64,
  pub deferred_retry_ms: u64,
  pub rate_limit_pause_ms: u64,
}

impl Default for PollConfig {
  fn default() -> Self {
    Self {
      interval_ms: 30_000,
      jitter_ms: 5_000,
      debounce_ms: 3_000,
      deferred_retry_ms: 500,
      rate_limit_pause_ms: 5 * 60 * 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  pub base_ms: u64,
  pub max_delay_ms: u64,
  pub jitter_ms: u64,
  pub max_attempts: u32,
  pub cooldown_ms: u64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base_ms: 1_000,
      max_delay_ms: 60_000,
      jitter_ms: 1_000,
      max_attempts: 5,
      cooldown_ms: 5 * 60 * 1000,
    }
  }
}

impl From<&BackoffConfig> for BackoffPolicy {
  fn from(c: &BackoffConfig) -> Self {
    BackoffPolicy {
      base: Duration::from_millis(c.base_ms),
      max_delay: Duration::from_millis(c.max_delay_ms),
      jitter: Duration::from_millis(c.jitter_ms),
      max_attempts: c.max_attempts,
      cooldown: Duration::from_millis(c.cooldown_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { ttl_ms: 5_000 }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.ttl_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  pub enabled: bool,
  /// Server-sent events endpoint
  pub url: String,
  pub channel: String,
  pub reconnect_ms: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      url: String::new(),
      channel: "collection-changed".into(),
      reconnect_ms: 5_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log directory (defaults to $XDG_DATA_HOME/livesync/logs)
  pub directory: Option<PathBuf>,
  /// Also log to stderr
  pub stderr: bool,
}

impl Config {
  /// Read, parse and validate the config file found by [`Config::locate`].
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = Self::locate(explicit_path)?;
    let contents = std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("{}: {}", path.display(), e))
  }

  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./livesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/livesync/config.yaml
  pub fn locate(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit_path {
      return p
        .exists()
        .then(|| p.to_path_buf())
        .ok_or_else(|| eyre!("Config file not found: {}", p.display()));
    }

    let candidates = [
      Some(PathBuf::from("livesync.yaml")),
      dirs::config_dir().map(|dir| dir.join("livesync").join("config.yaml")),
    ];
    candidates
      .into_iter()
      .flatten()
      .find(|p| p.exists())
      .ok_or_else(|| {
        eyre!("No configuration file found. Create one at ~/.config/livesync/config.yaml")
      })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.endpoint.url.trim().is_empty() {
      return Err(eyre!("endpoint.url is required"));
    }
    if self.realtime.enabled && self.realtime.url.trim().is_empty() {
      return Err(eyre!("realtime.url is required when realtime is enabled"));
    }
    if self.query.limit == 0 {
      return Err(eyre!("query.limit must be greater than zero"));
    }
    let shadowed = self.query.filters.conflicting_exact();
    if !shadowed.is_empty() {
      return Err(eyre!(
        "query.filters.exact cannot set reserved parameters: {}",
        shadowed.join(", ")
      ));
    }
    Ok(())
  }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      poll_interval: Duration::from_millis(self.poll.interval_ms),
      poll_jitter: Duration::from_millis(self.poll.jitter_ms),
      debounce: Duration::from_millis(self.poll.debounce_ms),
      deferred_retry: Duration::from_millis(self.poll.deferred_retry_ms),
      rate_limit_pause: Duration::from_millis(self.poll.rate_limit_pause_ms),
      watched_fields: self.watched_fields.clone(),
      channel: self.realtime.enabled.then(|| self.realtime.channel.clone()),
    }
  }

  /// Bearer token for the collection endpoint.
  ///
  /// Read from LIVESYNC_TOKEN; the endpoint may not need one.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LIVESYNC_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("endpoint:\n  url: https://api.example.com/sales\n").unwrap();
    assert_eq!(config.endpoint.timeout_ms, 10_000);
    assert_eq!(config.query.page, 1);
    assert_eq!(config.query.limit, 20);
    assert_eq!(config.watched_fields, vec!["status", "amount", "category"]);
    assert_eq!(config.cache.ttl(), Duration::from_secs(5));

    let options = config.sync_options();
    assert_eq!(options.poll_interval, Duration::from_secs(30));
    assert_eq!(options.channel, None);

    let policy = BackoffPolicy::from(&config.backoff);
    assert_eq!(policy, BackoffPolicy::default());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
endpoint:
  url: https://api.example.com/sales
  timeout_ms: 2500
query:
  page: 3
  limit: 50
  filters:
    status: completed
    date_from: 2024-05-01
    ranges:
      amount: { min: 10, max: 500 }
    exact:
      category: food
watched_fields: [status]
poll:
  interval_ms: 15000
realtime:
  enabled: true
  url: https://api.example.com/events
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.query.limit, 50);
    assert_eq!(config.query.filters.status.as_deref(), Some("completed"));
    assert_eq!(config.query.filters.ranges["amount"].max, Some(500.0));
    assert_eq!(
      config.sync_options().channel.as_deref(),
      Some("collection-changed")
    );
    assert_eq!(config.poll.jitter_ms, 5_000);
  }

  #[test]
  fn test_validation_errors() {
    assert!(Config::from_yaml("endpoint: {}\n").is_err());
    assert!(Config::from_yaml(
      "endpoint:\n  url: http://x\nrealtime:\n  enabled: true\n"
    )
    .is_err());
  }

  #[test]
  fn test_exact_filter_cannot_override_paging() {
    let yaml = "endpoint:\n  url: http://x\nquery:\n  filters:\n    exact:\n      page: \"3\"\n";
    let err = Config::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("page"));
  }

  #[test]
  fn test_load_from_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "endpoint:\n  url: http://localhost:8080/items").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.endpoint.url, "http://localhost:8080/items");

    let missing = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(missing.is_err());
  }
}
