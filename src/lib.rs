//! Keeps a local view of a fast-changing, paginated server collection fresh.
//!
//! Polls on a jittered timer, refreshes early on realtime signals, collapses
//! duplicate requests, backs off under rate limiting and reports which items
//! were created or updated between polls.

pub mod backoff;
pub mod channel;
pub mod collection;
pub mod config;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod logging;
pub mod sync;

pub use backoff::{BackoffController, BackoffPolicy};
pub use channel::{BroadcastTransport, ChannelBridge, ChannelTransport, SseTransport, Subscription};
pub use collection::{
  FetchOrchestrator, Filters, HttpPageSource, Item, ItemId, Page, PageRequest, PageSource,
  Pagination, QueryKey,
};
pub use config::Config;
pub use dedup::{Deduplicator, FetchSource, Fetched};
pub use error::FetchError;
pub use sync::{
  Advisory, RefreshError, RefreshSummary, SyncEvent, SyncHandle, SyncLoop, SyncOptions,
  SyncSnapshot,
};
