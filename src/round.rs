//! Per-round ephemeral state: the active step, the "have we broadcast yet" flags, and the
//! timeout handles for this round.

use crate::{message::Step, timeout::TimeoutScheduler};

pub(crate) struct RoundData {
  pub(crate) step: Step,

  pub(crate) sent_proposal: bool,
  pub(crate) sent_prevote: bool,
  pub(crate) sent_precommit: bool,

  pub(crate) timeouts: TimeoutScheduler,
}

impl RoundData {
  pub(crate) fn new() -> Self {
    RoundData {
      step: Step::Propose,
      sent_proposal: false,
      sent_prevote: false,
      sent_precommit: false,
      timeouts: TimeoutScheduler::new(),
    }
  }
}

impl Default for RoundData {
  fn default() -> Self {
    Self::new()
  }
}
