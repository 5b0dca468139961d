//! Error kinds surfaced by the consensus machine to the surrounding node.
//!
//! Old/future height and round are deliberately *not* constructed here for messages taking the
//! ordinary backlog path (see `backlog::Classification`) — they exist on this enum only for
//! callers (tests, accountability tooling) that want to name them uniformly.

use thiserror::Error;

use crate::ext::ValidatorId;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ConsensusError<V: ValidatorId> {
  #[error("message for a height already finalized")]
  OldHeightMessage,
  #[error("message for a height not yet reached")]
  FutureHeightMessage,
  #[error("message for a round already passed")]
  OldRoundMessage,
  #[error("message for a round not yet reached")]
  FutureRoundMessage,
  #[error("failed to decode message payload")]
  DecodeFailed,
  #[error("committed seal signer does not match the declared sender")]
  InvalidSenderOfCommittedSeal,
  #[error("sender {0:?} is not a member of the committee for this height")]
  UnauthorizedAddress(V),
  #[error("message subject is inconsistent with the sender's prior messages")]
  InconsistentSubject,
  #[error("engine has not been started")]
  StoppedEngine,
  #[error("block failed verification")]
  FailedVerification,
  #[error("sender {0:?} behaved maliciously")]
  Malicious(V),
}
