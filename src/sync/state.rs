use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::collection::{Item, PageRequest, Pagination};
use crate::error::FetchError;

/// Connectivity and freshness, mutated only by the sync loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
  pub connected: bool,
  pub last_update: Option<DateTime<Utc>>,
  /// Created items seen since the last acknowledge
  pub new_item_count: u64,
}

/// Read-only view of the sync loop, republished after every change.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
  pub items: Arc<Vec<Item>>,
  /// `None` until the first successful fetch
  pub pagination: Option<Pagination>,
  pub data_source: Option<String>,
  pub connection: ConnectionState,
  pub query: PageRequest,
  /// Background poll in progress
  pub is_polling: bool,
  /// A manual refresh is waiting for its poll
  pub is_manual_refresh_loading: bool,
  /// Timer polling paused after rate limiting
  pub polling_suspended: bool,
  pub last_error: Option<FetchError>,
}

impl SyncSnapshot {
  pub fn connected(&self) -> bool {
    self.connection.connected
  }

  pub fn new_item_count(&self) -> u64 {
    self.connection.new_item_count
  }
}
