//! Timeout configuration. Concrete durations are configuration, not part of safety — any choice
//! that grows linearly in round number preserves liveness once the network reaches GST.

use std::time::Duration;

/// Per-round timeout formulae: `timeout(r) = base + r * delta`.
#[derive(Clone, Copy, Debug)]
pub struct TendermintConfig {
  pub propose_base: Duration,
  pub propose_delta: Duration,

  pub prevote_base: Duration,
  pub prevote_delta: Duration,

  pub precommit_base: Duration,
  pub precommit_delta: Duration,

  /// Target spacing between blocks, used only to pace proposal timing hints; has no bearing on
  /// safety.
  pub block_time: Duration,
}

impl Default for TendermintConfig {
  fn default() -> Self {
    TendermintConfig {
      propose_base: Duration::from_secs(3),
      propose_delta: Duration::from_millis(500),

      prevote_base: Duration::from_secs(1),
      prevote_delta: Duration::from_millis(500),

      precommit_base: Duration::from_secs(1),
      precommit_delta: Duration::from_millis(500),

      block_time: Duration::from_secs(1),
    }
  }
}

impl TendermintConfig {
  pub fn timeout_propose(&self, round: i32) -> Duration {
    self.propose_base + self.propose_delta * round.max(0) as u32
  }

  pub fn timeout_prevote(&self, round: i32) -> Duration {
    self.prevote_base + self.prevote_delta * round.max(0) as u32
  }

  pub fn timeout_precommit(&self, round: i32) -> Duration {
    self.precommit_base + self.precommit_delta * round.max(0) as u32
  }
}
