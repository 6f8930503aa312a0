//! Backoff controller for server-side rate limiting.
//!
//! Only responses classified as rate-limited feed this controller. Ordinary
//! network hiccups are retried by the sync loop's own cadence and never touch
//! the attempt counter.
//!
//! Delays grow exponentially with a random jitter component:
//!
//! ```text
//! delay = min(base * 2^(attempt - 1) + random(0, jitter), max_delay)
//! ```
//!
//! Once `max_attempts` consecutive rate-limited attempts have been seen the
//! controller enters cooldown and refuses attempts until the cooldown window
//! has elapsed, after which the counter starts from zero again.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Tuning knobs for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub base: Duration,
  pub max_delay: Duration,
  pub jitter: Duration,
  /// Consecutive rate-limited attempts allowed before cooldown
  pub max_attempts: u32,
  pub cooldown: Duration,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
      jitter: Duration::from_secs(1),
      max_attempts: 5,
      cooldown: Duration::from_secs(5 * 60),
    }
  }
}

/// Process-lifetime retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
  pub attempt_count: u32,
  pub last_error_at: Option<Instant>,
}

/// What the caller should do after a rate-limited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
  /// Sleep for the given delay, then retry the same request.
  Retry(Duration),
  /// Stop retrying; attempts are refused for the remaining window.
  Cooldown(Duration),
}

#[derive(Debug, Clone)]
pub struct BackoffController {
  policy: BackoffPolicy,
  state: RetryState,
}

impl BackoffController {
  pub fn new(policy: BackoffPolicy) -> Self {
    Self {
      policy,
      state: RetryState::default(),
    }
  }

  pub fn policy(&self) -> &BackoffPolicy {
    &self.policy
  }

  pub fn state(&self) -> RetryState {
    self.state
  }

  /// Delay before retry number `attempt` (1-based), jitter excluded.
  pub fn base_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = self.policy.base.saturating_mul(1u32 << exponent);
    delay.min(self.policy.max_delay)
  }

  /// Jittered delay before retry number `attempt` (1-based), capped at `max_delay`.
  pub fn next_delay(&self, attempt: u32) -> Duration {
    let jitter_ms = self.policy.jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
      Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
      Duration::ZERO
    };
    (self.base_delay(attempt) + jitter).min(self.policy.max_delay)
  }

  pub fn should_enter_cooldown(&self, attempt: u32) -> bool {
    attempt >= self.policy.max_attempts
  }

  /// Time left in the cooldown window that started at `last_error_at`.
  pub fn cooldown_remaining(&self, last_error_at: Instant) -> Duration {
    self
      .policy
      .cooldown
      .saturating_sub(Instant::now().saturating_duration_since(last_error_at))
  }

  /// Gate an attempt. Returns the remaining wait if the controller is cooling down.
  ///
  /// An expired cooldown resets the attempt counter.
  pub fn check(&mut self) -> Result<(), Duration> {
    if !self.should_enter_cooldown(self.state.attempt_count) {
      return Ok(());
    }

    let remaining = self
      .state
      .last_error_at
      .map(|at| self.cooldown_remaining(at))
      .unwrap_or(Duration::ZERO);

    if remaining.is_zero() {
      tracing::debug!("rate-limit cooldown elapsed, resetting attempt counter");
      self.state = RetryState::default();
      Ok(())
    } else {
      Err(remaining)
    }
  }

  /// Record a rate-limited response and decide what happens next.
  pub fn record_rate_limited(&mut self) -> BackoffDecision {
    self.state.attempt_count = (self.state.attempt_count + 1).min(self.policy.max_attempts);
    self.state.last_error_at = Some(Instant::now());

    if self.should_enter_cooldown(self.state.attempt_count) {
      tracing::warn!(
        attempts = self.state.attempt_count,
        cooldown_secs = self.policy.cooldown.as_secs(),
        "retry ceiling reached, entering rate-limit cooldown"
      );
      BackoffDecision::Cooldown(self.policy.cooldown)
    } else {
      BackoffDecision::Retry(self.next_delay(self.state.attempt_count))
    }
  }

  pub fn record_success(&mut self) {
    self.state = RetryState::default();
  }
}

impl Default for BackoffController {
  fn default() -> Self {
    Self::new(BackoffPolicy::default())
  }
}
