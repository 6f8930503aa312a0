//! Realtime channel bridge.
//!
//! Turns an external push transport into bare "something changed" signals.
//! Payloads are never interpreted; the sync loop always re-fetches from the
//! collection endpoint. A missing or failing transport leaves the loop on
//! timer polling alone.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::RealtimeConfig;

/// Callback invoked once per received change notification.
pub type SignalFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Error, Debug)]
pub enum ChannelError {
  #[error("failed to connect to realtime endpoint: {0}")]
  Connect(String),

  #[error("realtime endpoint responded with HTTP {0}")]
  Status(u16),

  #[error("realtime stream broke: {0}")]
  Stream(String),
}

/// A push transport that can deliver change signals for a named channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
  /// Deliver signals for `channel` until the transport ends or the task is cancelled.
  async fn listen(&self, channel: &str, signal: SignalFn) -> Result<(), ChannelError>;
}

/// Adapter from a [`ChannelTransport`] to refresh signals.
#[derive(Clone, Default)]
pub struct ChannelBridge {
  transport: Option<Arc<dyn ChannelTransport>>,
}

impl ChannelBridge {
  pub fn new(transport: impl ChannelTransport) -> Self {
    Self {
      transport: Some(Arc::new(transport)),
    }
  }

  /// A bridge whose subscriptions never fire.
  pub fn disabled() -> Self {
    Self { transport: None }
  }

  /// Build the bridge described by the realtime config section.
  pub fn from_config(config: &RealtimeConfig) -> Self {
    if !config.enabled {
      return Self::disabled();
    }
    match SseTransport::new(config) {
      Ok(transport) => Self::new(transport),
      Err(e) => {
        tracing::warn!(error = %e, "realtime disabled");
        Self::disabled()
      }
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.transport.is_some()
  }

  /// Subscribe to `channel`. Dropping the returned [`Subscription`] unsubscribes.
  pub fn subscribe<F>(&self, channel: &str, on_signal: F) -> Subscription
  where
    F: Fn() + Send + Sync + 'static,
  {
    let Some(transport) = self.transport.clone() else {
      return Subscription::noop();
    };

    let channel = channel.to_string();
    let signal: SignalFn = Arc::new(on_signal);
    let task = tokio::spawn(async move {
      match transport.listen(&channel, signal).await {
        Ok(()) => tracing::debug!(%channel, "realtime channel closed"),
        Err(e) => {
          tracing::warn!(%channel, error = %e, "realtime channel unavailable, polling only")
        }
      }
    });

    Subscription { task: Some(task) }
  }
}

/// Handle to an active channel subscription.
#[derive(Debug)]
pub struct Subscription {
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn noop() -> Self {
    Self { task: None }
  }

  pub fn is_active(&self) -> bool {
    self.task.as_ref().is_some_and(|t| !t.is_finished())
  }

  /// Stop receiving signals. Safe to call more than once.
  pub fn unsubscribe(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

// ============================================================================
// In-process transport
// ============================================================================

/// In-process hub keyed by channel name, for embedding and tests.
#[derive(Clone, Default)]
pub struct BroadcastTransport {
  channels: Arc<Mutex<HashMap<String, broadcast::Sender<()>>>>,
}

impl BroadcastTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Notify every listener on `channel`. Returns how many listeners were reached.
  pub fn publish(&self, channel: &str) -> usize {
    self.sender(channel).send(()).unwrap_or(0)
  }

  fn sender(&self, channel: &str) -> broadcast::Sender<()> {
    let mut channels = self
      .channels
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    channels
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(64).0)
      .clone()
  }
}

#[async_trait]
impl ChannelTransport for BroadcastTransport {
  async fn listen(&self, channel: &str, signal: SignalFn) -> Result<(), ChannelError> {
    let mut rx = self.sender(channel).subscribe();
    loop {
      match rx.recv().await {
        Ok(()) => signal(),
        // Missed notifications collapse into one refresh anyway
        Err(broadcast::error::RecvError::Lagged(_)) => signal(),
        Err(broadcast::error::RecvError::Closed) => return Ok(()),
      }
    }
  }
}

// ============================================================================
// Server-sent events transport
// ============================================================================

/// Listens on a `text/event-stream` endpoint. Every dispatched event whose
/// name is absent or equal to the channel name counts as one signal.
pub struct SseTransport {
  client: reqwest::Client,
  url: Url,
  reconnect: Duration,
}

impl SseTransport {
  pub fn new(config: &RealtimeConfig) -> Result<Self, ChannelError> {
    let url = Url::parse(&config.url)
      .map_err(|e| ChannelError::Connect(format!("invalid url {}: {}", config.url, e)))?;
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| ChannelError::Connect(e.to_string()))?;

    Ok(Self {
      client,
      url,
      reconnect: Duration::from_millis(config.reconnect_ms),
    })
  }

  async fn stream_once(&self, channel: &str, signal: &SignalFn) -> Result<(), ChannelError> {
    let mut url = self.url.clone();
    url.query_pairs_mut().append_pair("channel", channel);

    let response = self
      .client
      .get(url)
      .header(reqwest::header::ACCEPT, "text/event-stream")
      .send()
      .await
      .map_err(|e| ChannelError::Connect(e.to_string()))?;

    if !response.status().is_success() {
      return Err(ChannelError::Status(response.status().as_u16()));
    }

    tracing::info!(%channel, "realtime channel connected");
    let mut parser = SseParser::default();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk.map_err(|e| ChannelError::Stream(e.to_string()))?;
      for event in parser.feed(&chunk) {
        if event.as_deref().map_or(true, |name| name == channel) {
          signal();
        }
      }
    }

    Ok(())
  }
}

#[async_trait]
impl ChannelTransport for SseTransport {
  async fn listen(&self, channel: &str, signal: SignalFn) -> Result<(), ChannelError> {
    loop {
      match self.stream_once(channel, &signal).await {
        Ok(()) => tracing::debug!(%channel, "realtime stream ended, reconnecting"),
        Err(e) => tracing::warn!(%channel, error = %e, "realtime stream failed, reconnecting"),
      }
      tokio::time::sleep(self.reconnect).await;
    }
  }
}

/// Incremental `text/event-stream` parser that only tracks event boundaries
/// and names.
#[derive(Debug, Default)]
struct SseParser {
  buffer: Vec<u8>,
  event: Option<String>,
  has_data: bool,
}

impl SseParser {
  /// Feed raw bytes; returns the names of events completed by this chunk
  /// (`None` for unnamed events).
  fn feed(&mut self, chunk: &[u8]) -> Vec<Option<String>> {
    self.buffer.extend_from_slice(chunk);
    let mut dispatched = Vec::new();

    while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
      let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
      let line = String::from_utf8_lossy(&raw);
      let line = line.trim_end_matches(['\n', '\r']);

      if line.is_empty() {
        if self.has_data || self.event.is_some() {
          dispatched.push(self.event.take());
        }
        self.has_data = false;
        continue;
      }
      if line.starts_with(':') {
        continue;
      }

      let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
      };
      match field {
        "event" => self.event = Some(value.to_string()),
        "data" => self.has_data = true,
        _ => {}
      }
    }

    dispatched
  }
}
