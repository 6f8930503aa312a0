//! The sync loop: owns the known collection and keeps it fresh.
//!
//! A single task owns all loop state and multiplexes its inputs with
//! `select!`:
//!
//! - the jittered poll timer
//! - debounced realtime channel signals
//! - manual refresh / acknowledge / query change commands
//! - the one deferred retry queued when a trigger lands mid-poll
//! - the rate-limit cooldown that suspends timer polling
//!
//! Consumers talk to it through a cloneable [`SyncHandle`], read state from a
//! `watch` snapshot and receive [`SyncEvent`]s on a single channel.

mod event;
mod state;
mod timer;

pub use event::{Advisory, SyncEvent};
pub use state::{ConnectionState, SyncSnapshot};
pub use timer::TimerSlot;

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::channel::{ChannelBridge, Subscription};
use crate::collection::{FetchOrchestrator, Item, Page, PageRequest, PageSource, Pagination};
use crate::dedup::Fetched;
use crate::diff::{diff_created, diff_updated};
use crate::error::{AdvisoryKind, FetchError};

/// Snapshot publisher shared between the loop and its handles. Only the loop
/// holds it strongly, so receivers see the channel close when the loop ends.
type StatePublisher = Arc<watch::Sender<SyncSnapshot>>;

/// Loop cadence and change-detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
  pub poll_interval: Duration,
  /// Upper bound of the random delay added to every tick
  pub poll_jitter: Duration,
  pub debounce: Duration,
  /// Delay of the single retry queued when a trigger arrives mid-poll
  pub deferred_retry: Duration,
  /// Timer suspension after rate limiting when the server gave no wait time
  pub rate_limit_pause: Duration,
  pub watched_fields: Vec<String>,
  /// Realtime channel to subscribe to, if any
  pub channel: Option<String>,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(30),
      poll_jitter: Duration::from_secs(5),
      debounce: Duration::from_secs(3),
      deferred_retry: Duration::from_millis(500),
      rate_limit_pause: Duration::from_secs(5 * 60),
      watched_fields: vec!["status".into(), "amount".into(), "category".into()],
      channel: Some("collection-changed".into()),
    }
  }
}

/// What a completed manual refresh changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
  pub created: usize,
  pub updated: usize,
  pub total: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("sync loop has shut down")]
  Closed,
}

type Reply = oneshot::Sender<Result<RefreshSummary, FetchError>>;

enum Command {
  Refresh(Reply),
  SetQuery(PageRequest),
  ChannelSignal,
  Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  Startup,
  Timer,
  Channel,
  Manual,
  Deferred,
  QueryChanged,
}

struct InFlightPoll {
  handle: JoinHandle<Result<Fetched<Page>, FetchError>>,
  waiters: Vec<Reply>,
  trigger: Trigger,
}

/// Cloneable handle to a running sync loop.
#[derive(Clone)]
pub struct SyncHandle {
  commands: mpsc::UnboundedSender<Command>,
  state: watch::Receiver<SyncSnapshot>,
  publisher: Weak<watch::Sender<SyncSnapshot>>,
  new_items: Arc<AtomicU64>,
}

impl SyncHandle {
  /// Current state of the loop.
  pub fn snapshot(&self) -> SyncSnapshot {
    self.state.borrow().clone()
  }

  /// A receiver notified on every state change.
  pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
    self.state.clone()
  }

  /// Wait until the snapshot satisfies `predicate`.
  pub async fn wait_for(
    &self,
    mut predicate: impl FnMut(&SyncSnapshot) -> bool,
  ) -> Result<SyncSnapshot, RefreshError> {
    let mut rx = self.state.clone();
    let snapshot = rx
      .wait_for(|s| predicate(s))
      .await
      .map_err(|_| RefreshError::Closed)?;
    Ok(snapshot.clone())
  }

  /// Poll now, outside the timer cadence. Failures only show up in the snapshot.
  pub async fn refresh(&self) {
    if let Err(e) = self.try_refresh().await {
      tracing::debug!(error = %e, "manual refresh failed");
    }
  }

  /// Poll now and report the outcome to the caller.
  pub async fn try_refresh(&self) -> Result<RefreshSummary, RefreshError> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(Command::Refresh(tx))
      .map_err(|_| RefreshError::Closed)?;
    rx.await
      .map_err(|_| RefreshError::Closed)?
      .map_err(RefreshError::from)
  }

  /// Reset the new-item counter. Leaves the collection untouched.
  ///
  /// Takes effect before this returns: the next [`SyncHandle::snapshot`]
  /// already reports zero.
  pub fn acknowledge(&self) {
    match self.publisher.upgrade() {
      Some(publisher) => publisher.send_modify(|snapshot| {
        self.new_items.store(0, Ordering::SeqCst);
        snapshot.connection.new_item_count = 0;
      }),
      None => self.new_items.store(0, Ordering::SeqCst),
    }
  }

  /// Switch page, limit or filters. The next successful poll becomes the new
  /// baseline and emits no created/updated events.
  pub fn set_query(&self, request: PageRequest) {
    let _ = self.commands.send(Command::SetQuery(request));
  }

  /// Stop the loop and wait for its teardown. Safe to call repeatedly.
  pub async fn shutdown(&self) {
    let (tx, rx) = oneshot::channel();
    if self.commands.send(Command::Shutdown(tx)).is_ok() {
      let _ = rx.await;
    }
  }

  pub fn is_closed(&self) -> bool {
    self.commands.is_closed()
  }
}

/// The sync engine. Construct and start it with [`SyncLoop::spawn`].
pub struct SyncLoop<S: PageSource> {
  orchestrator: Arc<FetchOrchestrator<S>>,
  options: SyncOptions,
  request: PageRequest,

  commands: mpsc::UnboundedReceiver<Command>,
  events: mpsc::UnboundedSender<SyncEvent>,
  state: StatePublisher,
  /// Created items since the last acknowledge; handles reset it directly
  new_items: Arc<AtomicU64>,

  items: Arc<Vec<Item>>,
  pagination: Option<Pagination>,
  data_source: Option<String>,
  connection: ConnectionState,
  last_error: Option<FetchError>,
  last_advisory: Option<AdvisoryKind>,
  /// The next successful poll replaces the collection without emitting events
  baseline_pending: bool,

  poll_timer: TimerSlot,
  debounce: TimerSlot,
  deferred_retry: TimerSlot,
  cooldown: TimerSlot,

  in_flight: Option<InFlightPoll>,
  /// A trigger arrived while a poll was running
  retry_after_poll: bool,
  queued_waiters: Vec<Reply>,
  subscription: Subscription,
}

impl<S: PageSource> SyncLoop<S> {
  /// Start a loop for `request`. It polls immediately, then on the jittered
  /// timer, on debounced channel signals and on demand.
  pub fn spawn(
    orchestrator: Arc<FetchOrchestrator<S>>,
    request: PageRequest,
    options: SyncOptions,
    bridge: &ChannelBridge,
  ) -> (SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let mut sync_loop = Self::new(orchestrator, request, options, command_rx, event_tx);

    if let Some(channel) = sync_loop.options.channel.clone() {
      let weak = command_tx.downgrade();
      sync_loop.subscription = bridge.subscribe(&channel, move || {
        if let Some(tx) = weak.upgrade() {
          let _ = tx.send(Command::ChannelSignal);
        }
      });
    }

    let handle = SyncHandle {
      commands: command_tx,
      state: sync_loop.state.subscribe(),
      publisher: Arc::downgrade(&sync_loop.state),
      new_items: Arc::clone(&sync_loop.new_items),
    };

    tokio::spawn(sync_loop.run());
    (handle, event_rx)
  }

  fn new(
    orchestrator: Arc<FetchOrchestrator<S>>,
    request: PageRequest,
    options: SyncOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SyncEvent>,
  ) -> Self {
    let (state, _) = watch::channel(SyncSnapshot {
      query: request.clone(),
      ..Default::default()
    });
    let state = Arc::new(state);

    Self {
      orchestrator,
      options,
      request,
      commands,
      events,
      state,
      new_items: Arc::new(AtomicU64::new(0)),
      items: Arc::new(Vec::new()),
      pagination: None,
      data_source: None,
      connection: ConnectionState::default(),
      last_error: None,
      last_advisory: None,
      baseline_pending: true,
      poll_timer: TimerSlot::new("poll"),
      debounce: TimerSlot::new("debounce"),
      deferred_retry: TimerSlot::new("deferred-retry"),
      cooldown: TimerSlot::new("rate-limit-cooldown"),
      in_flight: None,
      retry_after_poll: false,
      queued_waiters: Vec::new(),
      subscription: Subscription::noop(),
    }
  }

  async fn run(mut self) {
    self.start_poll(Trigger::Startup);
    self.schedule_next_tick();

    loop {
      tokio::select! {
        command = self.commands.recv() => match command {
          Some(Command::Shutdown(ack)) => {
            self.teardown();
            let _ = ack.send(());
            break;
          }
          Some(command) => self.handle_command(command),
          None => {
            self.teardown();
            break;
          }
        },
        _ = self.poll_timer.fired() => {
          self.schedule_next_tick();
          self.trigger(Trigger::Timer);
        }
        _ = self.debounce.fired() => self.trigger(Trigger::Channel),
        _ = self.deferred_retry.fired() => self.trigger(Trigger::Deferred),
        _ = self.cooldown.fired() => self.resume_polling(),
        joined = join_in_flight(&mut self.in_flight) => self.finish_poll(joined),
      }
    }

    tracing::debug!("sync loop stopped");
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::Refresh(reply) => {
        self.queued_waiters.push(reply);
        self.trigger(Trigger::Manual);
        self.publish();
      }
      Command::SetQuery(request) => self.change_query(request),
      Command::ChannelSignal => {
        tracing::debug!("realtime signal received, debouncing");
        self.debounce.schedule(self.options.debounce);
      }
      Command::Shutdown(ack) => {
        self.teardown();
        let _ = ack.send(());
      }
    }
  }

  /// Start a poll, or remember to retry once the running one finishes.
  fn trigger(&mut self, trigger: Trigger) {
    if self.in_flight.is_some() {
      if !self.retry_after_poll {
        tracing::debug!(?trigger, "poll in progress, deferring");
      }
      self.retry_after_poll = true;
      return;
    }
    self.start_poll(trigger);
  }

  fn start_poll(&mut self, trigger: Trigger) {
    let orchestrator = Arc::clone(&self.orchestrator);
    let request = self.request.clone();
    let handle = tokio::spawn(async move { orchestrator.fetch(&request).await });

    self.in_flight = Some(InFlightPoll {
      handle,
      waiters: std::mem::take(&mut self.queued_waiters),
      trigger,
    });
    self.publish();
  }

  fn finish_poll(&mut self, joined: Result<Result<Fetched<Page>, FetchError>, JoinError>) {
    let Some(poll) = self.in_flight.take() else {
      return;
    };

    if std::mem::take(&mut self.retry_after_poll) {
      self
        .deferred_retry
        .schedule_if_idle(self.options.deferred_retry);
    }

    let outcome = match joined {
      Ok(outcome) => outcome,
      Err(e) if e.is_cancelled() => Err(FetchError::Aborted),
      Err(e) => {
        tracing::error!(error = %e, "poll task failed");
        Err(FetchError::Unknown(e.to_string()))
      }
    };

    let reply = match outcome {
      Ok(fetched) => Ok(self.apply_page(fetched.data, poll.trigger)),
      Err(e) => {
        self.apply_failure(&e, poll.trigger);
        Err(e)
      }
    };

    // Waiters observe the state their poll produced
    self.publish();
    for waiter in poll.waiters {
      let _ = waiter.send(reply.clone());
    }
  }

  /// Diff against the held collection, emit events, then replace it.
  fn apply_page(&mut self, page: Page, trigger: Trigger) -> RefreshSummary {
    let baseline = std::mem::take(&mut self.baseline_pending);
    let (created, updated) = if baseline {
      (Vec::new(), Vec::new())
    } else {
      (
        diff_created(&page.items, &self.items),
        diff_updated(&page.items, &self.items, &self.options.watched_fields),
      )
    };

    let summary = RefreshSummary {
      created: created.len(),
      updated: updated.len(),
      total: page.pagination.total,
    };

    self.set_connected(true);
    self.last_error = None;
    self.last_advisory = None;

    if !created.is_empty() {
      self.new_items.fetch_add(created.len() as u64, Ordering::SeqCst);
      self.emit(SyncEvent::Created(created));
    }
    if !updated.is_empty() {
      self.emit(SyncEvent::Updated(updated));
    }

    self.items = Arc::new(page.items);
    self.pagination = Some(page.pagination);
    self.data_source = page.data_source;
    self.connection.last_update = Some(Utc::now());

    tracing::info!(
      ?trigger,
      baseline,
      created = summary.created,
      updated = summary.updated,
      total = summary.total,
      "poll succeeded"
    );
    summary
  }

  /// Keep the collection, drop connectivity, advise once per failure kind.
  fn apply_failure(&mut self, error: &FetchError, trigger: Trigger) {
    self.set_connected(false);
    self.last_error = Some(error.clone());

    let advisory = match error {
      FetchError::RateLimited { retry_after } => Advisory::RateLimited {
        retry_after: retry_after.unwrap_or(self.options.rate_limit_pause),
      },
      other => Advisory::ConnectionProblem {
        error: other.to_string(),
      },
    };
    let kind = advisory.kind();
    if self.last_advisory != Some(kind) {
      self.last_advisory = Some(kind);
      self.emit(SyncEvent::Advisory(advisory));
    }

    if error.is_rate_limited() {
      let pause = match error {
        FetchError::RateLimited {
          retry_after: Some(wait),
        } => *wait,
        _ => self.options.rate_limit_pause,
      };
      let was_suspended = self.cooldown.is_pending();
      self.poll_timer.cancel();
      self.cooldown.schedule(pause);
      if !was_suspended {
        tracing::warn!(pause_secs = pause.as_secs(), "rate limited, suspending timer polling");
        self.emit(SyncEvent::PollingSuspended { resume_in: pause });
      }
    } else if error.is_aborted() {
      tracing::debug!(?trigger, error = %error, "poll cut short, keeping last known collection");
    } else {
      tracing::warn!(?trigger, error = %error, "poll failed, keeping last known collection");
    }
  }

  fn resume_polling(&mut self) {
    tracing::info!("rate-limit pause over, resuming timer polling");
    self.schedule_next_tick();
    self.emit(SyncEvent::PollingResumed);
    self.publish();
  }

  fn change_query(&mut self, request: PageRequest) {
    if request == self.request {
      return;
    }

    tracing::info!("query changed, re-polling");
    self.request = request;
    self.baseline_pending = true;

    if let Some(previous) = self.in_flight.take() {
      previous.handle.abort();
      self.queued_waiters.extend(previous.waiters);
    }
    self.retry_after_poll = false;
    self.deferred_retry.cancel();
    self.start_poll(Trigger::QueryChanged);
  }

  /// Arm the poll timer for the next tick: base interval plus random jitter.
  fn schedule_next_tick(&mut self) {
    if self.cooldown.is_pending() {
      return;
    }
    let jitter_ms = self.options.poll_jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
      Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
      Duration::ZERO
    };
    self.poll_timer.schedule(self.options.poll_interval + jitter);
  }

  fn set_connected(&mut self, connected: bool) {
    if self.connection.connected != connected {
      self.connection.connected = connected;
      self.emit(SyncEvent::ConnectionChanged(connected));
    }
  }

  fn emit(&self, event: SyncEvent) {
    // Nobody listening is fine
    let _ = self.events.send(event);
  }

  fn publish(&self) {
    let in_flight_waiters = self
      .in_flight
      .as_ref()
      .is_some_and(|poll| !poll.waiters.is_empty());

    let mut next = SyncSnapshot {
      items: Arc::clone(&self.items),
      pagination: self.pagination,
      data_source: self.data_source.clone(),
      connection: self.connection.clone(),
      query: self.request.clone(),
      is_polling: self.in_flight.is_some(),
      is_manual_refresh_loading: in_flight_waiters || !self.queued_waiters.is_empty(),
      polling_suspended: self.cooldown.is_pending(),
      last_error: self.last_error.clone(),
    };
    // Read the counter under the channel lock so an acknowledge can't be overwritten
    self.state.send_modify(|snapshot| {
      next.connection.new_item_count = self.new_items.load(Ordering::SeqCst);
      *snapshot = next;
    });
  }

  /// Cancel every timer, abort the running poll and leave the channel.
  /// Idempotent.
  fn teardown(&mut self) {
    self.poll_timer.cancel();
    self.debounce.cancel();
    self.deferred_retry.cancel();
    self.cooldown.cancel();

    if let Some(poll) = self.in_flight.take() {
      poll.handle.abort();
      for waiter in poll.waiters {
        let _ = waiter.send(Err(FetchError::Aborted));
      }
    }
    for waiter in self.queued_waiters.drain(..) {
      let _ = waiter.send(Err(FetchError::Aborted));
    }
    self.retry_after_poll = false;

    if self.subscription.is_active() {
      tracing::debug!("leaving realtime channel");
    }
    self.subscription.unsubscribe();
    self.publish();
  }

  fn pending_timers(&self) -> usize {
    [
      &self.poll_timer,
      &self.debounce,
      &self.deferred_retry,
      &self.cooldown,
    ]
    .iter()
    .filter(|slot| slot.is_pending())
    .count()
  }
}

async fn join_in_flight(
  slot: &mut Option<InFlightPoll>,
) -> Result<Result<Fetched<Page>, FetchError>, JoinError> {
  match slot {
    Some(poll) => (&mut poll.handle).await,
    None => std::future::pending().await,
  }
}
