//! Traits and types of the external network being integrated with to provide consensus over.
//!
//! Everything in this module is a contract the surrounding node fulfils: transport delivery,
//! block production/execution, cryptographic signing, the validator-set oracle, and the chain
//! head store. The core never has a concrete implementation of any of it.

use core::{fmt::Debug, hash::Hash};

use async_trait::async_trait;
use parity_scale_codec::{Decode, Encode};

use crate::{
  BlockNumber, RoundNumber,
  message::{Message, SignedMessage},
};

pub trait ValidatorId: Send + Sync + Clone + Copy + PartialEq + Eq + Hash + Debug + Encode + Decode {}
impl<V: Send + Sync + Clone + Copy + PartialEq + Eq + Hash + Debug + Encode + Decode> ValidatorId for V {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockError {
  /// Invalid behavior entirely: the proposer is malicious.
  Fatal,
  /// Potentially valid behavior dependent on unsynchronized state (e.g. we haven't received the
  /// block's parent yet).
  Temporal,
}

/// An opaque block body. The core never inspects its contents, only its identity.
pub trait Block: Send + Sync + Clone + PartialEq + Debug + Encode + Decode {
  type Id: Send + Sync + Copy + Clone + PartialEq + Eq + Hash + Debug + AsRef<[u8]> + Encode + Decode;

  fn id(&self) -> Self::Id;
}

/// An immutable snapshot of validators and voting power for a given height (the "Committee
/// view" component). Proposer selection is a pure function of the round and this snapshot, so
/// it is computed here rather than delegated to the backend.
#[derive(Clone, Debug)]
pub struct Committee<V: ValidatorId> {
  validators: Vec<(V, u64)>,
  total_power: u64,
}

impl<V: ValidatorId> Committee<V> {
  /// Builds a committee snapshot. Panics if `validators` is empty or any power entry is zero,
  /// both of which are caller bugs (the validator-set oracle's responsibility to avoid).
  pub fn new(validators: Vec<(V, u64)>) -> Self {
    assert!(!validators.is_empty(), "committee must have at least one validator");
    assert!(validators.iter().all(|(_, power)| *power > 0), "voting power must be non-zero");
    let total_power = validators.iter().map(|(_, power)| power).sum();
    Committee { validators, total_power }
  }

  pub fn total_power(&self) -> u64 {
    self.total_power
  }

  /// Quorum threshold in voting power: floor(2 * total / 3) + 1.
  pub fn quorum(&self) -> u64 {
    ((self.total_power * 2) / 3) + 1
  }

  /// Amount of power that, if Byzantine, could still prevent quorum from ever being honest:
  /// total - quorum + 1.
  pub fn fault_threshold(&self) -> u64 {
    (self.total_power - self.quorum()) + 1
  }

  pub fn voting_power(&self, validator: V) -> u64 {
    self.validators.iter().find(|(v, _)| *v == validator).map(|(_, power)| *power).unwrap_or(0)
  }

  pub fn contains(&self, validator: V) -> bool {
    self.validators.iter().any(|(v, _)| *v == validator)
  }

  /// Deterministic, power-weighted proposer selection for a round. A pure function of `round`
  /// and this snapshot so every node agrees on it without further coordination.
  pub fn proposer(&self, round: RoundNumber) -> V {
    // A round is never negative in practice (StartRound only ever increments it), but the type
    // is signed per the data model, so clamp defensively.
    let r = u64::from(round.0.max(0) as u32);
    let target = r.wrapping_mul(0x9E37_79B9_7F4A_7C15) % self.total_power;
    let mut acc = 0u64;
    for (validator, power) in &self.validators {
      acc += power;
      if target < acc {
        return *validator;
      }
    }
    // Unreachable given total_power == sum of powers, but avoid a panic on rounding edge cases.
    self.validators[self.validators.len() - 1].0
  }
}

/// Marker bound for signature types, split out from `SignatureScheme` itself so that
/// `Data`/`Message`/`SignedMessage` can be generic purely over the signature type.
pub trait Signature: Send + Sync + Clone + PartialEq + Debug + Encode + Decode {}
impl<S: Send + Sync + Clone + PartialEq + Debug + Encode + Decode> Signature for S {}

/// The signing half of the backend: produces signatures over canonical message bytes and
/// verifies/aggregates them. Actual key custody is entirely the backend's concern.
#[async_trait]
pub trait SignatureScheme: Send + Sync {
  type ValidatorId: ValidatorId;
  type Signature: Signature;
  type Signer: Signer<Signature = Self::Signature> + Send + Sync;

  fn verify(&self, signer: Self::ValidatorId, msg: &[u8], sig: &Self::Signature) -> bool;

  /// Aggregates a committed-seal set into a single value handed to the chain head writer.
  fn aggregate(signatures: &[Self::Signature]) -> Self::Signature;
}

#[async_trait]
pub trait Signer: Send + Sync {
  type ValidatorId: ValidatorId;
  type Signature;

  /// This validator's own identity, if this node is a member of the current committee.
  async fn validator_id(&self) -> Option<Self::ValidatorId>;
  async fn sign(&self, msg: &[u8]) -> Self::Signature;
}

/// The aggregated signature set backing a committed block.
#[derive(Clone, Debug)]
pub struct Commit<S: SignatureScheme> {
  pub end_time: u64,
  pub validators: Vec<S::ValidatorId>,
  pub signature: S::Signature,
}

/// The Backend interface adapter: a thin facade over the signer, broadcaster, verifier, chain
/// head store, and validator-set oracle.
#[async_trait]
pub trait Network: Send + Sync {
  type ValidatorId: ValidatorId;
  type SignatureScheme: SignatureScheme<ValidatorId = Self::ValidatorId>;
  type Block: Block;

  fn signer(&self) -> <Self::SignatureScheme as SignatureScheme>::Signer;
  fn signature_scheme(&self) -> Self::SignatureScheme;

  /// The validator-set oracle: committee membership and voting power at a given height. Called
  /// once per height, at `StartHeight`, and held immutable for the remainder of that height.
  async fn committee(&self, height: BlockNumber) -> Committee<Self::ValidatorId>;

  /// Hands a signed outbound message to the transport. Fire-and-forget: must not block.
  async fn broadcast(&mut self, msg: SignedMessage<Self::ValidatorId, Self::Block, <Self::SignatureScheme as SignatureScheme>::Signature>);

  /// Verifies a proposed block body. A retry-worthy delay (e.g. missing parent) is modeled as the
  /// `Temporal` variant of `BlockError`: the core leaves the proposal unverified and re-attempts
  /// this call the next time its backlog replays, rather than treating it as misbehavior.
  async fn validate(&mut self, block: &Self::Block) -> Result<(), BlockError>;

  /// Hands a finalized block and its committed seal to the chain writer, returning the next
  /// block this node should propose.
  async fn add_block(&mut self, block: Self::Block, commit: Commit<Self::SignatureScheme>) -> Self::Block;

  /// Recomputes whether a commit is valid for the given block id, used as a sanity check before
  /// the core trusts its own aggregation.
  fn verify_commit(&self, id: <Self::Block as Block>::Id, commit: &Commit<Self::SignatureScheme>) -> bool;

  /// Tells the transport to forget its local de-duplication record for `msg`, so that it may be
  /// re-received and processed later (used when the future-height backlog evicts an entry).
  async fn remove_message_from_local_cache(
    &mut self,
    msg: &Message<Self::ValidatorId, Self::Block, <Self::SignatureScheme as SignatureScheme>::Signature>,
  );

  /// Advertises the hash of the block this node has broadcast a proposal for, so a peer-facing
  /// sync path can answer `ConsensusSync` queries.
  async fn set_proposed_block_hash(&mut self, hash: <Self::Block as Block>::Id);
}
