//! The consensus state machine: `StartRound`, the propose/prevote/precommit handlers, commit,
//! and the timeout callbacks, all serialized through a single-threaded event loop.
//!
//! Exactly one handler runs at a time: [`TendermintMachine::run`] multiplexes the inbound message
//! channel, the internal outbound-broadcast queue, timeout firings, and externally-observed
//! height advances with `futures::select_biased!`. A firing timer never calls back into the
//! machine's state directly; it posts a `TimeoutFired` onto its own channel, which is one more
//! branch of the same `select_biased!`, so every state mutation happens on this one task.

use std::{collections::VecDeque, sync::Arc};

use futures::{
  FutureExt, StreamExt,
  channel::mpsc,
  future::{self, Fuse},
};
use parity_scale_codec::Encode;

use crate::{
  BlockNumber, RoundNumber,
  awaiter::{BlockAwaiter, Stopped},
  backlog::{Backlog, Classification, check_message},
  block::{HeightData, Seal},
  config::TendermintConfig,
  error::ConsensusError,
  ext::{Block, BlockError, Commit, Network, SignatureScheme, Signer},
  message::{Data, Message, SignedMessage, Step, commit_msg},
  message_log::MessageStore,
  round::RoundData,
  timeout::TimeoutFired,
};

type Sig<N> = <<N as Network>::SignatureScheme as SignatureScheme>::Signature;
type Id<N> = <<N as Network>::Block as Block>::Id;

pub type StepSender<N> = mpsc::UnboundedSender<(Commit<<N as Network>::SignatureScheme>, <N as Network>::Block)>;
pub type MessageSender<N> =
  mpsc::UnboundedSender<SignedMessage<<N as Network>::ValidatorId, <N as Network>::Block, Sig<N>>>;

/// A running Tendermint machine, plus the channels used to feed it. The machine must have `run`
/// called on it from an asynchronous task.
pub struct TendermintHandle<N: Network> {
  /// Tells the machine a block has been committed and finalized externally (e.g. via block-sync
  /// catching this node up), carrying the proposal to build on top of next.
  pub step: StepSender<N>,
  /// Feeds messages received from the gossip layer into the machine.
  pub messages: MessageSender<N>,
  /// The rendezvous the local block builder pushes newly-built blocks into.
  pub awaiter: Arc<BlockAwaiter<N::Block>>,
  pub machine: TendermintMachine<N>,
}

pub struct TendermintMachine<N: Network> {
  network: N,
  signer: <N::SignatureScheme as SignatureScheme>::Signer,
  signature_scheme: N::SignatureScheme,
  config: TendermintConfig,

  queue: VecDeque<Message<N::ValidatorId, N::Block, Sig<N>>>,
  msg_recv: mpsc::UnboundedReceiver<SignedMessage<N::ValidatorId, N::Block, Sig<N>>>,
  step_recv: mpsc::UnboundedReceiver<(Commit<N::SignatureScheme>, N::Block)>,

  timeout_events: tokio::sync::mpsc::UnboundedSender<TimeoutFired>,
  timeout_recv: tokio::sync::mpsc::UnboundedReceiver<TimeoutFired>,

  backlog: Backlog<N::ValidatorId, Message<N::ValidatorId, N::Block, Sig<N>>>,
  awaiter: Arc<BlockAwaiter<N::Block>>,

  height: HeightData<N>,
}

impl<N: Network + 'static> TendermintMachine<N> {
  /// Builds a machine starting at the height immediately after `last_height`, proposing `proposal`
  /// if and when this node becomes proposer with no valid value carried over.
  ///
  /// `awaiter` is supplied by the caller rather than created here: the embedder's block-builder
  /// task needs a handle to it before this node's very first round, in case this node turns out
  /// to be that round's proposer, which this call cannot guarantee without blocking forever.
  #[allow(clippy::new_ret_no_self)]
  pub async fn new(
    mut network: N,
    config: TendermintConfig,
    last_height: BlockNumber,
    proposal: N::Block,
    awaiter: Arc<BlockAwaiter<N::Block>>,
  ) -> TendermintHandle<N> {
    let (msg_send, msg_recv) = mpsc::unbounded();
    let (step_send, step_recv) = mpsc::unbounded();
    let (timeout_send, timeout_recv) = tokio::sync::mpsc::unbounded_channel();

    let signer = network.signer();
    let signature_scheme = network.signature_scheme();
    let validator_id = signer.validator_id().await;

    let next_height = BlockNumber(last_height.0 + 1);
    let committee = Arc::new(network.committee(next_height).await);

    let height = HeightData {
      number: next_height,
      validator_id,
      committee: committee.clone(),
      proposal,
      log: MessageStore::new(committee),
      round: None,
      round_number: RoundNumber(0),
      locked: None,
      valid: None,
    };

    let mut machine = TendermintMachine {
      network,
      signer,
      signature_scheme,
      config,

      queue: VecDeque::new(),
      msg_recv,
      step_recv,

      timeout_events: timeout_send,
      timeout_recv,

      backlog: Backlog::new(),
      awaiter: awaiter.clone(),

      height,
    };
    machine.start_round(RoundNumber(0)).await;

    TendermintHandle { step: step_send, messages: msg_send, awaiter, machine }
  }

  fn broadcast(&mut self, data: Data<N::Block, Sig<N>>) {
    let Some(sender) = self.height.validator_id else { return };
    match data.step() {
      Step::Propose => self.height.round_mut().sent_proposal = true,
      Step::Prevote => self.height.round_mut().sent_prevote = true,
      Step::Precommit => self.height.round_mut().sent_precommit = true,
    }
    self.queue.push_back(Message {
      sender,
      number: self.height.number,
      round: self.height.round_number,
      data,
    });
  }

  /// Deterministic stand-in for a wall-clock "end time" of a round, used only to fill the
  /// canonical committed-seal bytes (`commit_msg`). This port carries no wall-clock
  /// synchronization between nodes (see DESIGN.md), so the value is derived purely from
  /// height/round rather than `SystemTime`, while still giving every node the same bytes to sign
  /// and verify.
  fn round_end_time(&self, round: RoundNumber) -> u64 {
    self.height.number.0.saturating_mul(self.config.block_time.as_secs().max(1)) + round.0.max(0) as u64
  }

  async fn sign_precommit(&self, round: RoundNumber, hash: Id<N>) -> Sig<N> {
    let bytes = commit_msg(self.round_end_time(round), hash.as_ref());
    self.signer.sign(&bytes).await
  }

  fn verify_committed_seal(&self, sender: N::ValidatorId, round: RoundNumber, hash: Id<N>, sig: &Sig<N>) -> bool {
    let bytes = commit_msg(self.round_end_time(round), hash.as_ref());
    self.signature_scheme.verify(sender, &bytes, sig)
  }

  fn build_commit(&self, round: RoundNumber, hash: Id<N>, sigs: Vec<Seal<N>>) -> (N::Block, Commit<N::SignatureScheme>) {
    let block = self.height.log.get(round).and_then(|r| r.proposal()).expect("commit requires a known proposal").block.clone();
    let validators = sigs.iter().map(|(v, _)| *v).collect();
    let signature = N::SignatureScheme::aggregate(&sigs.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>());
    (block, Commit { end_time: self.round_end_time(round), validators, signature })
  }

  /// Enters round `r`: resets round-local state, and either broadcasts a proposal (if this node
  /// is the round's proposer) or arms the propose timeout.
  async fn start_round(&mut self, round: RoundNumber) {
    self.height.round = Some(RoundData::new());
    self.height.round_number = round;
    self.height.log.get_or_create(round);

    if self.height.validator_id == Some(self.height.committee.proposer(round)) {
      let (valid_round, block) = match self.height.valid.clone() {
        Some((vr, block)) => (Some(vr), block),
        None => match self.awaiter.value(self.height.number).await {
          Ok(block) => (None, block),
          // The machine is shutting down; there's nothing left to propose.
          Err(Stopped) => return,
        },
      };
      let hash = block.id();
      self.broadcast(Data::Proposal(valid_round, block));
      self.network.set_proposed_block_hash(hash).await;
    } else {
      let duration = self.config.timeout_propose(round.0);
      let events = self.timeout_events.clone();
      self.height.round_mut().timeouts.schedule(duration, self.height.number, round, Step::Propose, events);
    }
  }

  /// Moves on to `next_height`, proposing `proposal` if and when this node becomes proposer.
  async fn start_height(&mut self, proposal: N::Block) {
    let next_height = BlockNumber(self.height.number.0 + 1);
    let committee = Arc::new(self.network.committee(next_height).await);
    let validator_id = self.signer.validator_id().await;

    // Anything still queued belongs to the height we're leaving.
    self.queue.clear();

    self.height = HeightData {
      number: next_height,
      validator_id,
      committee: committee.clone(),
      proposal,
      log: MessageStore::new(committee),
      round: None,
      round_number: RoundNumber(0),
      locked: None,
      valid: None,
    };

    self.start_round(RoundNumber(0)).await;
  }

  /// Handles a received proposal: validates the proposer, verifies the block, and if the round
  /// and step still match, casts this node's prevote.
  async fn handle_propose(
    &mut self,
    sender: N::ValidatorId,
    round: RoundNumber,
    valid_round: Option<RoundNumber>,
    block: N::Block,
  ) -> Result<(), ConsensusError<N::ValidatorId>> {
    if sender != self.height.committee.proposer(round) {
      return Err(ConsensusError::Malicious(sender));
    }
    if let Some(vr) = valid_round {
      if vr.0 >= round.0 {
        return Err(ConsensusError::Malicious(sender));
      }
    }

    let is_new = self.height.log.get_or_create(round).add_proposal(sender, valid_round, block.clone());
    let already_verified = self.height.log.get(round).map(|r| r.is_proposal_verified()).unwrap_or(false);
    // A resend of the exact proposal we already have on record but haven't yet verified: this is
    // how a `Temporal` validation failure gets retried, since it's re-queued into the backlog
    // below rather than dropped.
    let pending_retry = !is_new
      && !already_verified
      && self
        .height
        .log
        .get(round)
        .and_then(|r| r.proposal())
        .map(|p| p.sender == sender && p.valid_round == valid_round && p.block == block)
        .unwrap_or(false);

    if !is_new && !pending_retry {
      return Ok(());
    }

    if !already_verified {
      match self.network.validate(&block).await {
        Ok(()) => self.height.log.get_or_create(round).mark_proposal_verified(),
        Err(BlockError::Temporal) => {
          self.backlog.store_backlog(
            sender,
            self.height.validator_id,
            Message { sender, number: self.height.number, round, data: Data::Proposal(valid_round, block) },
          );
          return Ok(());
        }
        Err(BlockError::Fatal) => return Err(ConsensusError::Malicious(sender)),
      }
    }

    if round != self.height.round_number || self.height.round().step != Step::Propose || self.height.round().sent_prevote {
      return Ok(());
    }

    let vote = self.decide_prevote(round, valid_round, &block);
    self.broadcast(Data::Prevote(vote));
    self.height.round_mut().step = Step::Prevote;
    Ok(())
  }

  /// The prevote-value decision embedded in `HandlePropose`: honors both the plain locking rule
  /// and the proposer's `validRound` override.
  fn decide_prevote(&self, round: RoundNumber, valid_round: Option<RoundNumber>, block: &N::Block) -> Option<Id<N>> {
    let hash = block.id();
    let locked_ok = match self.height.locked {
      None => true,
      Some((_, locked_hash)) => locked_hash == hash,
    };
    if locked_ok {
      return Some(hash);
    }

    let vr = valid_round?;
    let round_msgs = self.height.log.get(vr)?;
    if round_msgs.prevote_power(&self.height.committee, Some(hash)) < self.height.committee.quorum() {
      return None;
    }
    let can_override = match self.height.locked {
      None => true,
      Some((locked_round, locked_hash)) => locked_round.0 <= vr.0 || locked_hash == hash,
    };
    can_override.then_some(hash)
  }

  /// Handles a received prevote: records it, arms the prevote timeout once quorum is first seen,
  /// and locks/precommits or precommits nil once the relevant quorum is reached.
  async fn handle_prevote(
    &mut self,
    round: RoundNumber,
    sender: N::ValidatorId,
    value: Option<Id<N>>,
  ) -> Result<(), ConsensusError<N::ValidatorId>> {
    let is_new = self.height.log.get_or_create(round).add_prevote(sender, value);
    if !is_new || round != self.height.round_number {
      return Ok(());
    }

    let step = self.height.round().step;
    let quorum = self.height.committee.quorum();
    let round_msgs = self.height.log.get(round).expect("inserted above");
    let total_power = round_msgs.total_prevote_power(&self.height.committee);
    let nil_power = round_msgs.prevote_power(&self.height.committee, None);
    let proposal_block = round_msgs.proposal().map(|p| p.block.clone());
    let verified = round_msgs.is_proposal_verified();

    if step == Step::Prevote && total_power >= quorum && !self.height.round().timeouts.armed(Step::Prevote) {
      let duration = self.config.timeout_prevote(round.0);
      let events = self.timeout_events.clone();
      self.height.round_mut().timeouts.schedule(duration, self.height.number, round, Step::Prevote, events);
    }

    if step != Step::Propose && !self.height.round().sent_precommit {
      if let Some(block) = proposal_block {
        let hash = block.id();
        let value_power = self.height.log.get(round).unwrap().prevote_power(&self.height.committee, Some(hash));
        if value_power >= quorum && verified {
          self.height.valid = Some((round, block));
          if step == Step::Prevote {
            self.height.locked = Some((round, hash));
            let sig = self.sign_precommit(round, hash).await;
            self.broadcast(Data::Precommit(Some((hash, sig))));
            self.height.round_mut().step = Step::Precommit;
          }
        }
      }
    }

    if step == Step::Prevote && nil_power >= quorum && !self.height.round().sent_precommit {
      self.broadcast(Data::Precommit(None));
      self.height.round_mut().step = Step::Precommit;
    }

    Ok(())
  }

  /// Handles a received precommit, unified across the current round and any older round: finality
  /// is reached the instant any round accumulates precommit quorum for its own verified proposal
  /// (see DESIGN.md).
  async fn handle_precommit(
    &mut self,
    round: RoundNumber,
    sender: N::ValidatorId,
    value: Option<(Id<N>, Sig<N>)>,
  ) -> Result<Option<(N::Block, Commit<N::SignatureScheme>)>, ConsensusError<N::ValidatorId>> {
    if let Some((hash, sig)) = &value {
      if !self.verify_committed_seal(sender, round, *hash, sig) {
        return Err(ConsensusError::InvalidSenderOfCommittedSeal);
      }
    }
    let (hash, sig) = match value {
      Some((hash, sig)) => (Some(hash), Some(sig)),
      None => (None, None),
    };

    let is_new = self.height.log.get_or_create(round).add_precommit(sender, hash, sig);
    if !is_new {
      return Ok(None);
    }

    let quorum = self.height.committee.quorum();
    let round_msgs = self.height.log.get(round).expect("inserted above");
    let proposal_hash = round_msgs.proposal_hash();
    let verified = round_msgs.is_proposal_verified();
    let total_power = round_msgs.total_precommit_power(&self.height.committee);

    if let Some(proposal_hash) = proposal_hash {
      if verified {
        let value_power = self.height.log.get(round).unwrap().precommit_power(&self.height.committee, Some(proposal_hash));
        if value_power >= quorum {
          let sigs = self.height.log.get(round).unwrap().precommit_signatures(proposal_hash);
          if round == self.height.round_number {
            self.height.round_mut().timeouts.stop(Step::Precommit);
          }
          return Ok(Some(self.build_commit(round, proposal_hash, sigs)));
        }
      }
    }

    if round == self.height.round_number
      && total_power >= quorum
      && !self.height.round().timeouts.armed(Step::Precommit)
    {
      let duration = self.config.timeout_precommit(round.0);
      let events = self.timeout_events.clone();
      self.height.round_mut().timeouts.schedule(duration, self.height.number, round, Step::Precommit, events);
    }

    Ok(None)
  }

  /// Classifies and dispatches one decoded, already signature-verified message.
  async fn process(
    &mut self,
    msg: Message<N::ValidatorId, N::Block, Sig<N>>,
  ) -> Result<Option<(N::Block, Commit<N::SignatureScheme>)>, ConsensusError<N::ValidatorId>> {
    if msg.number.0 != self.height.number.0 {
      if msg.number.0 > self.height.number.0 {
        if let Some(evicted) = self.backlog.store_future_message(msg.number, msg) {
          self.network.remove_message_from_local_cache(&evicted).await;
        }
      } else {
        log::debug!("dropping message for already-finalized height {:?}", msg.number);
      }
      return Ok(None);
    }

    if !self.height.committee.contains(msg.sender) {
      return Err(ConsensusError::UnauthorizedAddress(msg.sender));
    }

    match check_message(msg.number, msg.round, self.height.number, self.height.round_number) {
      Classification::FutureRound => {
        self.backlog.store_backlog(msg.sender, self.height.validator_id, msg);
        return Ok(None);
      }
      Classification::OldRound => {
        // An old round's own precommits can still reach quorum on a late flood and finalize;
        // every other old-round message kind is moot once we've moved past it.
        if let Data::Precommit(value) = msg.data {
          return self.handle_precommit(msg.round, msg.sender, value).await;
        }
        log::debug!("dropping {:?} for a round already passed", msg.data.step());
        return Ok(None);
      }
      Classification::Ok | Classification::OldHeight | Classification::FutureHeight => {}
    }

    match msg.data {
      Data::Proposal(valid_round, block) => self.handle_propose(msg.sender, msg.round, valid_round, block).await?,
      Data::Prevote(value) => self.handle_prevote(msg.round, msg.sender, value).await?,
      Data::Precommit(value) => return self.handle_precommit(msg.round, msg.sender, value).await,
    }
    Ok(None)
  }

  /// Re-checks every backlogged message against current state and redelivers what's resolved.
  /// Invoked after entering a new round and after every processed message, so a message that
  /// arrived ahead of its step gets retried as soon as that step is reached.
  async fn replay_backlog(&mut self) {
    let current_height = self.height.number;
    let current_round = self.height.round_number;
    let mut resolved = self.backlog.process_future_messages(current_height);
    resolved.extend(self.backlog.process_backlog(|msg| {
      check_message(msg.number, msg.round, current_height, current_round)
    }));

    for msg in resolved {
      self.deliver_resolved(msg).await;
    }
  }

  /// Runs a backlog-resolved message through the same path as a freshly-processed one, without
  /// re-broadcasting it (it was already broadcast, if at all, by whoever sent it originally).
  async fn deliver_resolved(&mut self, msg: Message<N::ValidatorId, N::Block, Sig<N>>) {
    match self.process(msg).await {
      Ok(None) => {}
      Ok(Some((block, commit))) => self.on_commit(block, commit).await,
      Err(ConsensusError::Malicious(validator)) => log::warn!("validator {validator:?} behaved maliciously"),
      Err(err) => log::warn!("error replaying backlogged message: {err}"),
    }
  }

  async fn on_commit(&mut self, block: N::Block, commit: Commit<N::SignatureScheme>) {
    debug_assert!(self.network.verify_commit(block.id(), &commit));
    let next_proposal = self.network.add_block(block, commit).await;
    self.start_height(next_proposal).await;
  }

  async fn on_timeout(&mut self, fired: TimeoutFired) {
    if fired.height.0 != self.height.number.0 || fired.round.0 != self.height.round_number.0 {
      return;
    }
    self.height.round_mut().timeouts.stop(fired.step);
    if self.height.round().step != fired.step {
      return;
    }

    match fired.step {
      Step::Propose => {
        log::debug!("propose timeout fired for round {:?}; prevoting nil", fired.round);
        self.broadcast(Data::Prevote(None));
        self.height.round_mut().step = Step::Prevote;
      }
      Step::Prevote => {
        self.broadcast(Data::Precommit(None));
        self.height.round_mut().step = Step::Precommit;
      }
      Step::Precommit => {
        self.start_round(RoundNumber(self.height.round_number.0 + 1)).await;
      }
    }
  }

  /// Drives the machine. Must be spawned onto its own task; never returns until both the message
  /// and step channels close.
  pub async fn run(mut self) {
    loop {
      let mut queue_future = if self.queue.is_empty() { Fuse::terminated() } else { future::ready(()).fuse() };

      let outcome = futures::select_biased! {
        advanced = self.step_recv.next() => {
          match advanced {
            Some((_commit, proposal)) => {
              // An externally-observed commit (e.g. block-sync) jumps us straight to the next
              // height; our own in-flight round state for the height we were on is moot.
              self.start_height(proposal).await;
              None
            }
            None => break,
          }
        },
        _ = queue_future => Some((true, self.queue.pop_front().unwrap())),
        fired = self.timeout_recv.recv().fuse() => {
          match fired {
            Some(fired) => { self.on_timeout(fired).await; None }
            None => break,
          }
        },
        received = self.msg_recv.next() => {
          match received {
            Some(signed) => {
              if !signed.verify_signature(&self.signature_scheme) {
                log::debug!("dropping message with invalid signature from {:?}", signed.sender());
                None
              } else {
                Some((false, signed.into_message()))
              }
            }
            None => break,
          }
        },
      };

      let Some((broadcast, msg)) = outcome else {
        self.replay_backlog().await;
        continue;
      };

      match self.process(msg.clone()).await {
        Ok(None) => {}
        Ok(Some((block, commit))) => self.on_commit(block, commit).await,
        Err(ConsensusError::Malicious(validator)) => log::warn!("validator {validator:?} behaved maliciously"),
        Err(err) => log::warn!("error processing message from {:?}: {err}", msg.sender),
      }

      if broadcast {
        let sig = self.signer.sign(&msg.encode()).await;
        self.network.broadcast(SignedMessage::from_parts(msg, sig)).await;
      }

      self.replay_backlog().await;
    }
  }
}
