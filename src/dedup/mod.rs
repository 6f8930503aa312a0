//! Request deduplication and short-lived caching.
//!
//! This module provides a transport-agnostic layer that:
//! - Collapses N concurrent requests for the same query into one call
//! - Serves repeated requests from memory for a few seconds (TTL)
//! - Never caches failures; every joined caller sees the same error

mod layer;
mod traits;

pub use layer::Deduplicator;
pub use traits::{FetchSource, Fetched};
