//! A Byzantine-fault-tolerant implementation of the Tendermint consensus algorithm, generic over
//! an opaque block type and the surrounding node's transport, signing, and validator-set oracle.
//!
//! The crate covers the finality layer only: the per-height/per-round protocol loop, the message
//! store and quorum accounting, round-change and timeout discipline, the future-message backlog,
//! and the block-awaiter rendezvous with an external block producer. Everything else (gossip,
//! block execution, key custody, chain storage) is a trait the embedder implements — see
//! [`ext::Network`].

use parity_scale_codec::{Decode, Encode};

mod awaiter;
mod backlog;
mod block;
pub mod config;
pub mod error;
pub mod ext;
mod machine;
pub mod message;
mod message_log;
mod round;
mod timeout;

pub use awaiter::{BlockAwaiter, Stopped};
pub use config::TendermintConfig;
pub use error::ConsensusError;
pub use machine::{MessageSender, StepSender, TendermintHandle, TendermintMachine};
pub use message::SignedMessage;

/// A block height: a monotonically increasing index over committed blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode)]
pub struct BlockNumber(pub u64);

/// A round index within a height. Signed per the data model, though it is never negative once a
/// height is underway; `-1` is reserved to represent "no round" (e.g. an unset `validRound`),
/// which this crate models as `Option<RoundNumber>` rather than as the sentinel value itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode)]
pub struct RoundNumber(pub i32);
