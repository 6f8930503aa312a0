//! Fetch orchestration: deduplication, rate-limit backoff and supersession.

use futures::future::{AbortHandle, Abortable};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::client::PageSource;
use super::query::QueryKey;
use super::types::{Filters, Page, PageRequest};
use crate::backoff::{BackoffController, BackoffDecision, BackoffPolicy};
use crate::dedup::{Deduplicator, Fetched};
use crate::error::FetchError;

/// The fetches that currently own the "active" slot. They all share one key.
#[derive(Default)]
struct ActiveFetches {
  key: Option<QueryKey>,
  handles: Vec<(u64, AbortHandle)>,
  next_id: u64,
}

/// Drives a [`PageSource`] through the deduplicator and the backoff controller.
///
/// The orchestrator owns its cache and retry counters; build one per sync
/// session rather than sharing a global instance.
pub struct FetchOrchestrator<S> {
  source: Arc<S>,
  dedup: Deduplicator<Page>,
  backoff: Mutex<BackoffController>,
  active: Arc<Mutex<ActiveFetches>>,
}

impl<S: PageSource> FetchOrchestrator<S> {
  pub fn new(source: S, cache_ttl: Duration, policy: BackoffPolicy) -> Self {
    Self {
      source: Arc::new(source),
      dedup: Deduplicator::new(cache_ttl),
      backoff: Mutex::new(BackoffController::new(policy)),
      active: Arc::new(Mutex::new(ActiveFetches::default())),
    }
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn backoff_state(&self) -> crate::backoff::RetryState {
    self.backoff().state()
  }

  pub async fn fetch_page(
    &self,
    page: u32,
    limit: u32,
    filters: Filters,
  ) -> Result<Fetched<Page>, FetchError> {
    self.fetch(&PageRequest::new(page, limit, filters)).await
  }

  /// Fetch one page.
  ///
  /// Starting a fetch for a different query aborts every fetch still running
  /// for the previous one; a fetch for the same query joins it instead.
  pub async fn fetch(&self, request: &PageRequest) -> Result<Fetched<Page>, FetchError> {
    let key = QueryKey::new(request);
    let (handle, registration) = AbortHandle::new_pair();
    let _active = self.activate(&key, handle);

    match Abortable::new(self.fetch_with_backoff(&key, request), registration).await {
      Ok(result) => result,
      Err(_) => {
        tracing::debug!(query = %key.digest(), "fetch superseded");
        Err(FetchError::Aborted)
      }
    }
  }

  async fn fetch_with_backoff(
    &self,
    key: &QueryKey,
    request: &PageRequest,
  ) -> Result<Fetched<Page>, FetchError> {
    loop {
      let gate = self.backoff().check();
      if let Err(remaining) = gate {
        tracing::warn!(
          query = %key.digest(),
          remaining_secs = remaining.as_secs(),
          "rate-limit cooldown active, refusing request"
        );
        return Err(FetchError::RateLimited {
          retry_after: Some(remaining),
        });
      }

      let source = Arc::clone(&self.source);
      let owned_request = request.clone();
      let outcome = self
        .dedup
        .execute(key, move || async move {
          source.fetch_page(&owned_request).await
        })
        .await;

      match outcome {
        Ok(fetched) => {
          self.backoff().record_success();
          return Ok(fetched);
        }
        Err(FetchError::RateLimited { retry_after }) => {
          let decision = self.backoff().record_rate_limited();
          match decision {
            BackoffDecision::Retry(delay) => {
              let max_delay = self.backoff().policy().max_delay;
              let delay = retry_after.map_or(delay, |ra| ra.max(delay)).min(max_delay);
              tracing::warn!(
                query = %key.digest(),
                delay_ms = delay.as_millis() as u64,
                "rate limited, backing off"
              );
              tokio::time::sleep(delay).await;
            }
            BackoffDecision::Cooldown(window) => {
              return Err(FetchError::RateLimited {
                retry_after: Some(window.max(retry_after.unwrap_or_default())),
              });
            }
          }
        }
        Err(e) => {
          tracing::debug!(query = %key.digest(), error = %e, "fetch failed");
          return Err(e);
        }
      }
    }
  }

  /// Register a fetch for `key`, aborting fetches for any other key.
  fn activate(&self, key: &QueryKey, handle: AbortHandle) -> ActiveGuard {
    let mut active = lock(&self.active);

    if active.key.as_ref() != Some(key) {
      for (_, previous) in active.handles.drain(..) {
        previous.abort();
      }
      active.key = Some(key.clone());
    }

    let id = active.next_id;
    active.next_id += 1;
    active.handles.push((id, handle));

    ActiveGuard {
      active: Arc::clone(&self.active),
      id,
    }
  }

  fn backoff(&self) -> MutexGuard<'_, BackoffController> {
    self
      .backoff
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Removes a finished (or dropped) fetch from the active set.
struct ActiveGuard {
  active: Arc<Mutex<ActiveFetches>>,
  id: u64,
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    let mut active = lock(&self.active);
    active.handles.retain(|(id, _)| *id != self.id);
  }
}

fn lock(active: &Mutex<ActiveFetches>) -> MutexGuard<'_, ActiveFetches> {
  active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collection::test_support::{page, ScriptedSource};
  use crate::collection::Item;
  use crate::dedup::FetchSource;

  fn policy() -> BackoffPolicy {
    BackoffPolicy {
      base: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
      jitter: Duration::ZERO,
      max_attempts: 3,
      cooldown: Duration::from_secs(300),
    }
  }

  fn rate_limited() -> Result<Page, FetchError> {
    Err(FetchError::RateLimited { retry_after: None })
  }

  fn request(page: u32) -> PageRequest {
    PageRequest::new(page, 20, Filters::default())
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_returns_normalized_page() {
    let source = ScriptedSource::new(vec![Ok(page(vec![Item::new(1)], 1))]);
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let fetched = orchestrator
      .fetch_page(1, 20, Filters::default())
      .await
      .unwrap();
    assert_eq!(fetched.data.items, vec![Item::new(1)]);
    assert_eq!(fetched.data.pagination.total, 1);
    assert_eq!(fetched.source, FetchSource::Network);
    assert_eq!(orchestrator.source().calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rate_limit_retries_then_succeeds() {
    let source = ScriptedSource::new(vec![rate_limited(), Ok(page(vec![], 0))]);
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let started = tokio::time::Instant::now();
    let fetched = orchestrator.fetch(&request(1)).await;
    assert!(fetched.is_ok());
    assert_eq!(orchestrator.source().calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(orchestrator.backoff_state().attempt_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_after_header_extends_delay() {
    let source = ScriptedSource::new(vec![
      Err(FetchError::RateLimited {
        retry_after: Some(Duration::from_secs(7)),
      }),
      Ok(page(vec![], 0)),
    ]);
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let started = tokio::time::Instant::now();
    orchestrator.fetch(&request(1)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(7));
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_retries_enter_cooldown() {
    let source = ScriptedSource::new(vec![rate_limited()]);
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let err = orchestrator.fetch(&request(1)).await.unwrap_err();
    assert_eq!(
      err,
      FetchError::RateLimited {
        retry_after: Some(Duration::from_secs(300))
      }
    );
    assert_eq!(orchestrator.source().calls(), 3);

    // Inside the window: refused without touching the network
    tokio::time::advance(Duration::from_secs(60)).await;
    let err = orchestrator.fetch(&request(1)).await.unwrap_err();
    assert!(matches!(err, FetchError::RateLimited { retry_after: Some(d) } if d <= Duration::from_secs(240)));
    assert_eq!(orchestrator.source().calls(), 3);

    // After the window the counter starts over
    tokio::time::advance(Duration::from_secs(300)).await;
    orchestrator.source().push(Ok(page(vec![], 0)));
    orchestrator.fetch(&request(1)).await.unwrap();
    assert_eq!(orchestrator.source().calls(), 4);
    assert_eq!(orchestrator.backoff_state().attempt_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_http_error_is_not_retried() {
    let source = ScriptedSource::new(vec![Err(FetchError::HttpError { status: 502 })]);
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let err = orchestrator.fetch(&request(1)).await.unwrap_err();
    assert_eq!(err, FetchError::HttpError { status: 502 });
    assert_eq!(orchestrator.source().calls(), 1);
    assert_eq!(orchestrator.backoff_state().attempt_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_new_query_supersedes_old_one() {
    let source = ScriptedSource::new(vec![Ok(page(vec![], 0))])
      .with_delay(Duration::from_millis(200));
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let (r1, r2) = (request(1), request(2));
    let (first, second) = tokio::join!(orchestrator.fetch(&r1), async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      orchestrator.fetch(&r2).await
    });

    assert_eq!(first.unwrap_err(), FetchError::Aborted);
    assert!(second.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_query_is_joined_not_aborted() {
    let source = ScriptedSource::new(vec![Ok(page(vec![Item::new(5)], 1))])
      .with_delay(Duration::from_millis(200));
    let orchestrator = FetchOrchestrator::new(source, Duration::from_secs(5), policy());

    let r1 = request(1);
    let (first, second) = tokio::join!(orchestrator.fetch(&r1), async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      orchestrator.fetch(&r1).await
    });

    assert_eq!(first.unwrap().source, FetchSource::Network);
    assert_eq!(second.unwrap().source, FetchSource::Joined);
    assert_eq!(orchestrator.source().calls(), 1);
  }
}
