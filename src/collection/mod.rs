//! The remote collection: wire types, query identity, HTTP client and the
//! fetch orchestrator that sits in front of it.

pub mod api_types;
pub mod client;
pub mod orchestrator;
pub mod query;
pub mod types;

pub use client::{HttpPageSource, PageSource};
pub use orchestrator::FetchOrchestrator;
pub use query::QueryKey;
pub use types::{Filters, Item, ItemId, Page, PageRequest, Pagination, RangeFilter};

#[cfg(test)]
pub(crate) mod test_support {
  use async_trait::async_trait;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  use super::{Item, Page, PageRequest, PageSource, Pagination};
  use crate::error::FetchError;

  pub fn page(items: Vec<Item>, total: u64) -> Page {
    Page {
      items,
      pagination: Pagination {
        page: 1,
        limit: 20,
        total,
        page_count: 1,
      },
      data_source: None,
    }
  }

  /// Replays queued responses in order; once the queue is empty the last
  /// response repeats.
  pub struct ScriptedSource {
    queue: Mutex<VecDeque<Result<Page, FetchError>>>,
    last: Mutex<Option<Result<Page, FetchError>>>,
    calls: AtomicU32,
    delay: Duration,
  }

  impl ScriptedSource {
    pub fn new(responses: Vec<Result<Page, FetchError>>) -> Self {
      Self {
        queue: Mutex::new(responses.into()),
        last: Mutex::new(None),
        calls: AtomicU32::new(0),
        delay: Duration::ZERO,
      }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    pub fn push(&self, response: Result<Page, FetchError>) {
      self.queue.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<Page, FetchError> {
      let mut last = self.last.lock().unwrap();
      if let Some(next) = self.queue.lock().unwrap().pop_front() {
        *last = Some(next);
      }
      last
        .clone()
        .unwrap_or_else(|| Err(FetchError::Unknown("no scripted response".into())))
    }
  }

  #[async_trait]
  impl PageSource for ScriptedSource {
    async fn fetch_page(&self, _request: &PageRequest) -> Result<Page, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let response = self.next_response();
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      response
    }
  }
}
