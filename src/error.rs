//! Classified fetch failures.

use std::time::Duration;
use thiserror::Error;

/// Why a page fetch failed.
///
/// The value is `Clone` because a single network outcome is handed to every
/// caller that joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The server asked us to slow down (HTTP 429) and the backoff budget is spent.
  #[error("rate limited{}", fmt_retry_after(.retry_after))]
  RateLimited { retry_after: Option<Duration> },

  /// Cancelled by the caller or superseded by a request for another query.
  #[error("request aborted")]
  Aborted,

  /// The request exceeded its timeout budget.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Connectivity failure (DNS, TLS, connection reset, ...).
  #[error("network error: {0}")]
  NetworkTransient(String),

  /// Any other non-2xx response.
  #[error("server responded with HTTP {status}")]
  HttpError { status: u16 },

  #[error("unexpected error: {0}")]
  Unknown(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
  match retry_after {
    Some(d) => format!(", retry in {}s", d.as_secs()),
    None => String::new(),
  }
}

/// Which user-facing advisory a failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvisoryKind {
  RateLimited,
  ConnectionProblem,
}

impl FetchError {
  /// Aborts and timeouts travel the same path.
  pub fn is_aborted(&self) -> bool {
    matches!(self, FetchError::Aborted | FetchError::Timeout(_))
  }

  pub fn is_rate_limited(&self) -> bool {
    matches!(self, FetchError::RateLimited { .. })
  }

  /// Classify a reqwest transport error.
  pub fn from_transport(err: &reqwest::Error, timeout: Duration) -> Self {
    if err.is_timeout() {
      FetchError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() || err.is_body() {
      FetchError::NetworkTransient(err.to_string())
    } else if let Some(status) = err.status() {
      FetchError::from_status(status.as_u16(), None)
    } else if err.is_decode() {
      FetchError::Unknown(err.to_string())
    } else {
      FetchError::NetworkTransient(err.to_string())
    }
  }

  /// Map a non-2xx status code.
  pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
    match status {
      429 => FetchError::RateLimited { retry_after },
      _ => FetchError::HttpError { status },
    }
  }
}
