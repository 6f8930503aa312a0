use std::time::Duration;

use crate::collection::Item;
use crate::error::AdvisoryKind;

/// Notifications published by the sync loop, in the order they happened.
///
/// For one successful poll the order is always `Created` then `Updated`; two
/// polls never interleave.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Items whose id was not in the previous collection
  Created(Vec<Item>),
  /// Items whose watched fields changed since the previous collection
  Updated(Vec<Item>),
  ConnectionChanged(bool),
  /// A user-facing advisory, at most one per transition into failure
  Advisory(Advisory),
  /// Timer polling paused after rate limiting
  PollingSuspended { resume_in: Duration },
  PollingResumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
  RateLimited { retry_after: Duration },
  ConnectionProblem { error: String },
}

impl Advisory {
  pub fn kind(&self) -> AdvisoryKind {
    match self {
      Advisory::RateLimited { .. } => AdvisoryKind::RateLimited,
      Advisory::ConnectionProblem { .. } => AdvisoryKind::ConnectionProblem,
    }
  }

  pub fn message(&self) -> String {
    match self {
      Advisory::RateLimited { retry_after } => format!(
        "Too many requests. Live updates paused for about {} min.",
        retry_after.as_secs().div_ceil(60).max(1)
      ),
      Advisory::ConnectionProblem { error } => {
        format!("Connection problem ({}). Retrying in the background.", error)
      }
    }
  }
}
