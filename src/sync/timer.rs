use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// A named timer with at most one pending deadline.
///
/// Awaiting [`TimerSlot::fired`] on an idle slot never completes, which lets
/// idle slots sit in a `select!` without special casing.
#[derive(Debug)]
pub struct TimerSlot {
  name: &'static str,
  deadline: Option<Pin<Box<Sleep>>>,
}

impl TimerSlot {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      deadline: None,
    }
  }

  /// Arm the slot, replacing any pending deadline.
  pub fn schedule(&mut self, delay: Duration) {
    let deadline = Instant::now() + delay;
    match &mut self.deadline {
      Some(sleep) => sleep.as_mut().reset(deadline),
      None => self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline))),
    }
  }

  /// Arm the slot only if nothing is pending. Returns whether it was armed.
  pub fn schedule_if_idle(&mut self, delay: Duration) -> bool {
    if self.is_pending() {
      return false;
    }
    self.schedule(delay);
    true
  }

  pub fn cancel(&mut self) {
    self.deadline = None;
  }

  pub fn is_pending(&self) -> bool {
    self.deadline.is_some()
  }

  pub fn remaining(&self) -> Option<Duration> {
    self
      .deadline
      .as_ref()
      .map(|sleep| sleep.deadline().saturating_duration_since(Instant::now()))
  }

  /// Completes when the pending deadline passes, leaving the slot idle.
  ///
  /// Cancel safe: dropping the future keeps the deadline armed.
  pub async fn fired(&mut self) {
    match &mut self.deadline {
      Some(sleep) => {
        sleep.as_mut().await;
        self.deadline = None;
        tracing::trace!(timer = self.name, "timer fired");
      }
      None => std::future::pending().await,
    }
  }
}
