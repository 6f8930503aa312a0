//! Request deduplication with a short-lived result cache.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{FetchSource, Fetched};
use crate::collection::QueryKey;
use crate::error::FetchError;

type Outcome<T> = Result<(T, DateTime<Utc>), FetchError>;
type SharedFetch<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct CacheEntry<T> {
  result: T,
  fetched_at: DateTime<Utc>,
  expires_at: Instant,
}

struct InFlightEntry<T> {
  /// Distinguishes a settled request from a newer one registered under the same key
  id: u64,
  /// Weak so that a request every caller walked away from is dropped, not leaked
  handle: WeakShared<BoxFuture<'static, Outcome<T>>>,
}

struct DedupState<T> {
  cache: HashMap<QueryKey, CacheEntry<T>>,
  in_flight: HashMap<QueryKey, InFlightEntry<T>>,
  next_id: u64,
}

/// Collapses identical concurrent requests into one call and serves
/// very recent results from memory.
///
/// Each instance owns its own cache and in-flight map; nothing is global.
/// Failures are never cached.
pub struct Deduplicator<T> {
  state: Arc<Mutex<DedupState<T>>>,
  ttl: Duration,
}

impl<T> Deduplicator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(ttl: Duration) -> Self {
    Self {
      state: Arc::new(Mutex::new(DedupState {
        cache: HashMap::new(),
        in_flight: HashMap::new(),
        next_id: 0,
      })),
      ttl,
    }
  }

  /// Run `perform` for `key` unless a fresh cached result or an in-flight
  /// call for the same key can answer instead.
  ///
  /// 1. Fresh cache entry - return it, `perform` is not called
  /// 2. In-flight call - await its outcome
  /// 3. Otherwise start `perform`, cache a success, always clear the in-flight entry
  pub async fn execute<F, Fut>(&self, key: &QueryKey, perform: F) -> Result<Fetched<T>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let (shared, source) = {
      let mut state = lock(&self.state);

      let now = Instant::now();
      if let Some(entry) = state.cache.get(key).filter(|e| e.expires_at > now) {
        tracing::debug!(query = %key.digest(), "serving cached page");
        return Ok(Fetched::new(
          entry.result.clone(),
          FetchSource::Cache,
          entry.fetched_at,
        ));
      }
      // Anything still cached under this key has expired
      state.cache.remove(key);

      let joined = state
        .in_flight
        .get(key)
        .and_then(|entry| entry.handle.upgrade());

      match joined {
        Some(shared) => {
          tracing::debug!(query = %key.digest(), "joining in-flight request");
          (shared, FetchSource::Joined)
        }
        None => {
          let id = state.next_id;
          state.next_id += 1;

          let fut = perform();
          let state_ref = Arc::clone(&self.state);
          let owned_key = key.clone();
          let ttl = self.ttl;
          let shared: SharedFetch<T> = async move {
            let outcome = fut.await;
            settle(&state_ref, &owned_key, id, ttl, outcome)
          }
          .boxed()
          .shared();

          if let Some(handle) = shared.downgrade() {
            state
              .in_flight
              .insert(key.clone(), InFlightEntry { id, handle });
          }
          (shared, FetchSource::Network)
        }
      }
    };

    let (data, fetched_at) = shared.await?;
    Ok(Fetched::new(data, source, fetched_at))
  }

  #[cfg(test)]
  fn in_flight_len(&self) -> usize {
    lock(&self.state).in_flight.len()
  }

  #[cfg(test)]
  fn cache_len(&self) -> usize {
    lock(&self.state).cache.len()
  }
}

/// Record the outcome of a finished call. Runs exactly once per network call.
///
/// Also sweeps expired cache entries and in-flight entries nobody awaits any
/// more, so keys that are never requested again do not pile up.
fn settle<T: Clone>(
  state: &Mutex<DedupState<T>>,
  key: &QueryKey,
  id: u64,
  ttl: Duration,
  outcome: Result<T, FetchError>,
) -> Outcome<T> {
  let mut state = lock(state);

  if state.in_flight.get(key).map(|entry| entry.id) == Some(id) {
    state.in_flight.remove(key);
  }

  let now = Instant::now();
  state.cache.retain(|_, entry| entry.expires_at > now);
  state
    .in_flight
    .retain(|_, entry| entry.handle.upgrade().is_some());

  let data = outcome?;
  let fetched_at = Utc::now();
  state.cache.insert(
    key.clone(),
    CacheEntry {
      result: data.clone(),
      fetched_at,
      expires_at: now + ttl,
    },
  );
  Ok((data, fetched_at))
}

/// The maps are only touched in short synchronous sections, so a poisoned
/// lock still guards consistent data.
fn lock<T>(state: &Mutex<DedupState<T>>) -> MutexGuard<'_, DedupState<T>> {
  state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Clone for Deduplicator<T> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      ttl: self.ttl,
    }
  }
}
