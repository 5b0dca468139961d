//! The core's per-height state: the message store for the height, the locking variables, and
//! the currently active round.

use std::sync::Arc;

use crate::{
  BlockNumber, RoundNumber,
  ext::{Block, Committee, Network},
  message_log::MessageStore,
  round::RoundData,
};

pub(crate) struct HeightData<N: Network> {
  pub(crate) number: BlockNumber,
  pub(crate) validator_id: Option<N::ValidatorId>,
  pub(crate) committee: Arc<Committee<N::ValidatorId>>,

  /// The block this node will propose next, if it becomes the proposer and holds no valid
  /// value from a prior round.
  pub(crate) proposal: N::Block,

  pub(crate) log: MessageStore<
    N::ValidatorId,
    N::Block,
    <N::SignatureScheme as crate::ext::SignatureScheme>::Signature,
  >,

  pub(crate) round: Option<RoundData>,
  pub(crate) round_number: RoundNumber,

  /// Tendermint's locking variables. `None` represents round `-1`.
  pub(crate) locked: Option<(RoundNumber, <N::Block as Block>::Id)>,
  pub(crate) valid: Option<(RoundNumber, N::Block)>,
}

impl<N: Network> HeightData<N> {
  pub(crate) fn round(&self) -> &RoundData {
    self.round.as_ref().expect("round not started")
  }

  pub(crate) fn round_mut(&mut self) -> &mut RoundData {
    self.round.as_mut().expect("round not started")
  }
}

pub(crate) type Seal<N> =
  (<N as Network>::ValidatorId, <<N as Network>::SignatureScheme as crate::ext::SignatureScheme>::Signature);
