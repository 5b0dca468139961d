//! Arms/cancels one-shot timers tagged with (height, round, step).
//!
//! Per the concurrency model, a firing timer does not invoke a handler directly: it posts an
//! event onto the core's inbound channel, which the single-threaded event loop picks up and
//! guards for staleness (current (H, R, step) still matching) before acting on it. This keeps
//! the core's state mutation single-threaded even though timers run on their own tokio tasks.

use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::{BlockNumber, RoundNumber, message::Step};

/// A timeout that has elapsed, posted to the core's inbound channel rather than invoked as a
/// direct callback (see module docs).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct TimeoutFired {
  pub(crate) height: BlockNumber,
  pub(crate) round: RoundNumber,
  pub(crate) step: Step,
}

/// Arms and cancels the (at most three, one per step) timers for a single round.
pub(crate) struct TimeoutScheduler {
  armed: HashMap<Step, JoinHandle<()>>,
}

impl TimeoutScheduler {
  pub(crate) fn new() -> Self {
    TimeoutScheduler { armed: HashMap::new() }
  }

  pub(crate) fn armed(&self, step: Step) -> bool {
    self.armed.contains_key(&step)
  }

  /// Arms a timer for `step`, posting a `TimeoutFired` to `events` after `duration`. Rejects
  /// re-arming a step that's already armed; the caller is expected to check `armed()` first.
  pub(crate) fn schedule(
    &mut self,
    duration: std::time::Duration,
    height: BlockNumber,
    round: RoundNumber,
    step: Step,
    events: tokio::sync::mpsc::UnboundedSender<TimeoutFired>,
  ) {
    if self.armed(step) {
      log::debug!("timer for {:?} already armed, ignoring re-schedule", step);
      return;
    }
    let handle = tokio::spawn(async move {
      tokio::time::sleep(duration).await;
      // The receiver may be gone if the engine has been shut down; that's fine, the timer was
      // about to become moot anyway.
      let _ = events.send(TimeoutFired { height, round, step });
    });
    self.armed.insert(step, handle);
  }

  /// Cancels a timer. A no-op, not an error, if the timer isn't armed.
  pub(crate) fn stop(&mut self, step: Step) {
    if let Some(handle) = self.armed.remove(&step) {
      handle.abort();
    }
  }

  /// Cancels every timer for this round (called on round transition and shutdown).
  pub(crate) fn stop_all(&mut self) {
    for (_, handle) in self.armed.drain() {
      handle.abort();
    }
  }
}

impl Drop for TimeoutScheduler {
  fn drop(&mut self) {
    self.stop_all();
  }
}
