//! Per-round aggregation of proposals and votes with power accounting by value hash.
//!
//! The store never verifies signatures — callers ensure authenticity before logging a message.
//! Adds are idempotent per sender per kind: a replay of an identical message is a no-op: an
//! equivocating message (same sender, same kind, different value) is retained as evidence but
//! never contributes further power, matching invariant #2 (no double vote counted) and #3
//! (quorum monotonicity).

use std::{collections::HashMap, sync::Arc};

use crate::{
  RoundNumber,
  ext::{Block, Committee, Signature, ValidatorId},
  message::Step,
};

/// A further, non-power-contributing vote or proposal from a sender who already has one on
/// record for this round and kind. Consumed by an accountability subsystem out of scope here.
#[derive(Clone, Debug)]
pub struct Equivocation<V: ValidatorId, Id> {
  pub sender: V,
  pub step: Step,
  pub first: Option<Id>,
  pub conflicting: Option<Id>,
}

#[derive(Clone, Debug)]
pub(crate) struct Proposal<V: ValidatorId, B: Block> {
  pub(crate) sender: V,
  pub(crate) valid_round: Option<RoundNumber>,
  pub(crate) block: B,
}

/// For one (H, R): at most one proposal per sender, a set of prevotes keyed by sender, a set of
/// precommits keyed by sender, plus the verified flag for the proposal.
pub(crate) struct RoundMessages<V: ValidatorId, B: Block, S: Signature> {
  proposal: Option<Proposal<V, B>>,
  proposal_verified: bool,

  prevotes: HashMap<V, Option<B::Id>>,
  precommits: HashMap<V, (Option<B::Id>, Option<S>)>,

  evidence: Vec<Equivocation<V, B::Id>>,
}

impl<V: ValidatorId, B: Block, S: Signature> RoundMessages<V, B, S> {
  fn new() -> Self {
    RoundMessages {
      proposal: None,
      proposal_verified: false,
      prevotes: HashMap::new(),
      precommits: HashMap::new(),
      evidence: Vec::new(),
    }
  }

  pub(crate) fn proposal(&self) -> Option<&Proposal<V, B>> {
    self.proposal.as_ref()
  }

  pub(crate) fn proposal_hash(&self) -> Option<B::Id> {
    self.proposal.as_ref().map(|p| p.block.id())
  }

  pub(crate) fn is_proposal_verified(&self) -> bool {
    self.proposal_verified
  }

  pub(crate) fn mark_proposal_verified(&mut self) {
    self.proposal_verified = true;
  }

  /// Returns `true` if this is a newly recorded proposal from `sender`. A second, differing
  /// proposal from the same sender (only the proposer should ever send one) is equivocation.
  pub(crate) fn add_proposal(
    &mut self,
    sender: V,
    valid_round: Option<RoundNumber>,
    block: B,
  ) -> bool {
    if let Some(existing) = &self.proposal {
      if existing.sender == sender {
        if existing.valid_round == valid_round && existing.block == block {
          return false;
        }
        self.evidence.push(Equivocation {
          sender,
          step: Step::Propose,
          first: Some(existing.block.id()),
          conflicting: Some(block.id()),
        });
        return false;
      }
    }
    if self.proposal.is_none() {
      self.proposal = Some(Proposal { sender, valid_round, block });
      return true;
    }
    false
  }

  pub(crate) fn add_prevote(&mut self, sender: V, value: Option<B::Id>) -> bool {
    match self.prevotes.get(&sender) {
      None => {
        self.prevotes.insert(sender, value);
        true
      }
      Some(existing) => {
        if *existing != value {
          self.evidence.push(Equivocation {
            sender,
            step: Step::Prevote,
            first: *existing,
            conflicting: value,
          });
        }
        false
      }
    }
  }

  pub(crate) fn add_precommit(&mut self, sender: V, value: Option<B::Id>, sig: Option<S>) -> bool {
    match self.precommits.get(&sender) {
      None => {
        self.precommits.insert(sender, (value, sig));
        true
      }
      Some((existing, _)) => {
        if *existing != value {
          self.evidence.push(Equivocation {
            sender,
            step: Step::Precommit,
            first: *existing,
            conflicting: value,
          });
        }
        false
      }
    }
  }

  pub(crate) fn evidence(&self) -> &[Equivocation<V, B::Id>] {
    &self.evidence
  }

  fn power_for<T: Eq>(
    &self,
    committee: &Committee<V>,
    entries: impl Iterator<Item = (V, T)>,
    value: &T,
  ) -> u64 {
    entries.filter(|(_, v)| v == value).map(|(sender, _)| committee.voting_power(sender)).sum()
  }

  pub(crate) fn prevote_power(&self, committee: &Committee<V>, value: Option<B::Id>) -> u64 {
    self.power_for(committee, self.prevotes.iter().map(|(s, v)| (*s, *v)), &value)
  }

  pub(crate) fn precommit_power(&self, committee: &Committee<V>, value: Option<B::Id>) -> u64 {
    self.power_for(
      committee,
      self.precommits.iter().map(|(s, (v, _))| (*s, *v)),
      &value,
    )
  }

  pub(crate) fn total_prevote_power(&self, committee: &Committee<V>) -> u64 {
    self.prevotes.keys().map(|v| committee.voting_power(*v)).sum()
  }

  pub(crate) fn total_precommit_power(&self, committee: &Committee<V>) -> u64 {
    self.precommits.keys().map(|v| committee.voting_power(*v)).sum()
  }

  /// Precommit signatures for every sender who precommitted `value`, used to build the
  /// committed-seal set on commit.
  pub(crate) fn precommit_signatures(&self, value: B::Id) -> Vec<(V, S)> {
    self
      .precommits
      .iter()
      .filter_map(|(sender, (v, sig))| {
        if *v == Some(value) { sig.clone().map(|sig| (*sender, sig)) } else { None }
      })
      .collect()
  }
}

/// The message store for an entire height: created at `StartHeight`, destroyed when the height
/// advances. Holds one `RoundMessages` per round referenced so far.
pub(crate) struct MessageStore<V: ValidatorId, B: Block, S: Signature> {
  rounds: HashMap<RoundNumber, RoundMessages<V, B, S>>,
  committee: Arc<Committee<V>>,
}

impl<V: ValidatorId, B: Block, S: Signature> MessageStore<V, B, S> {
  pub(crate) fn new(committee: Arc<Committee<V>>) -> Self {
    MessageStore { rounds: HashMap::new(), committee }
  }

  pub(crate) fn get_or_create(&mut self, round: RoundNumber) -> &mut RoundMessages<V, B, S> {
    self.rounds.entry(round).or_insert_with(RoundMessages::new)
  }

  pub(crate) fn get(&self, round: RoundNumber) -> Option<&RoundMessages<V, B, S>> {
    self.rounds.get(&round)
  }

  pub(crate) fn committee(&self) -> &Committee<V> {
    &self.committee
  }
}
