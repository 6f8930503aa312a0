//! Result wrapper for deduplicated fetches.

use chrono::{DateTime, Utc};

/// Result of a deduplicated fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: FetchSource,
  /// When the underlying network call completed
  pub fetched_at: DateTime<Utc>,
}

impl<T> Fetched<T> {
  pub fn new(data: T, source: FetchSource, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      fetched_at,
    }
  }
}

/// Indicates how a caller's result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// This caller started the network call
  Network,
  /// Served from the short-lived cache, no network call
  Cache,
  /// Joined a network call another caller had already started
  Joined,
}
