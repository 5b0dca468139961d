//! Two buffers for messages the machine isn't ready to process yet: per-sender future-round
//! messages for the current height, and a bounded cross-height future buffer.
//!
//! The per-sender queues are drained after every step transition, and the future-height buffer
//! evicts the entry at the furthest-ahead height once it would exceed 1000 total entries,
//! instructing the transport to forget its dedup record for the evicted message so it can be
//! re-received later.

use std::collections::{HashMap, VecDeque};

use crate::{BlockNumber, RoundNumber, ext::ValidatorId};

pub const MAX_FUTURE_HEIGHT_BACKLOG: usize = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Classification {
  Ok,
  OldHeight,
  FutureHeight,
  OldRound,
  FutureRound,
}

pub(crate) fn check_message(
  msg_height: BlockNumber,
  msg_round: RoundNumber,
  current_height: BlockNumber,
  current_round: RoundNumber,
) -> Classification {
  if msg_height.0 > current_height.0 {
    Classification::FutureHeight
  } else if msg_height.0 < current_height.0 {
    Classification::OldHeight
  } else if msg_round.0 > current_round.0 {
    Classification::FutureRound
  } else if msg_round.0 < current_round.0 {
    Classification::OldRound
  } else {
    Classification::Ok
  }
}

pub(crate) struct Backlog<V: ValidatorId, M> {
  /// Future-round messages for the current height, queued per sender.
  per_sender: HashMap<V, VecDeque<M>>,
  /// Strictly-future-height messages, queued per height.
  future: HashMap<BlockNumber, VecDeque<M>>,
  future_len: usize,
}

impl<V: ValidatorId, M> Backlog<V, M> {
  pub(crate) fn new() -> Self {
    Backlog { per_sender: HashMap::new(), future: HashMap::new(), future_len: 0 }
  }

  /// Called when a current-height message arrives for a future round. Messages from the local
  /// address are rejected (we never need to replay our own messages to ourselves).
  pub(crate) fn store_backlog(&mut self, sender: V, local: Option<V>, msg: M) {
    if local == Some(sender) {
      log::warn!("rejected backlogging a message from our own address");
      return;
    }
    self.per_sender.entry(sender).or_default().push_back(msg);
  }

  /// Returns the number of entries currently buffered for strictly-future heights.
  pub(crate) fn future_len(&self) -> usize {
    self.future_len
  }

  /// Stores a strictly-future-height message. If this would push the buffer past
  /// `MAX_FUTURE_HEIGHT_BACKLOG`, the tail entry of the furthest-ahead height is evicted instead
  /// and returned, so the caller can tell the transport to forget its dedup record for it.
  pub(crate) fn store_future_message(&mut self, height: BlockNumber, msg: M) -> Option<M> {
    self.future.entry(height).or_default().push_back(msg);
    self.future_len += 1;

    if self.future_len > MAX_FUTURE_HEIGHT_BACKLOG {
      let max_height = self.future.keys().filter(|h| !self.future[h].is_empty()).copied().max();
      if let Some(max_height) = max_height {
        let queue = self.future.get_mut(&max_height).unwrap();
        let evicted = queue.pop_back();
        if evicted.is_some() {
          self.future_len -= 1;
        }
        if queue.is_empty() {
          self.future.remove(&max_height);
        }
        return evicted;
      }
    }
    None
  }

  /// Re-checks every per-sender queued message against current state, in receive order per
  /// sender, and returns those that are now resolved (no longer future) for the caller to
  /// redeliver. After processing, shrinks any queue whose capacity has grown to more than 5x its
  /// length, to avoid unbounded retention from a burst that has since drained.
  ///
  /// Returns owned messages rather than taking a delivery callback: the caller typically needs
  /// to `.await` while redelivering each one, which would otherwise borrow `self` a second time.
  pub(crate) fn process_backlog(&mut self, mut classify: impl FnMut(&M) -> Classification) -> Vec<M> {
    let mut resolved = Vec::new();
    for queue in self.per_sender.values_mut() {
      let mut remaining = VecDeque::with_capacity(queue.len());
      while let Some(msg) = queue.pop_front() {
        match classify(&msg) {
          Classification::FutureHeight | Classification::FutureRound => remaining.push_back(msg),
          _ => resolved.push(msg),
        }
      }
      *queue = remaining;
      if queue.capacity() > queue.len() * 5 {
        queue.shrink_to_fit();
      }
    }
    resolved
  }

  /// Returns (and clears) every future-height entry for `current_height`, and discards every
  /// entry for a height below it.
  pub(crate) fn process_future_messages(&mut self, current_height: BlockNumber) -> Vec<M> {
    let resolved = self.future.remove(&current_height).map(Vec::from).unwrap_or_default();
    self.future.retain(|&height, _| height.0 > current_height.0);
    self.future_len = self.future.values().map(VecDeque::len).sum();
    resolved
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_relative_to_current_state() {
    let h = BlockNumber(10);
    let r = RoundNumber(2);
    assert_eq!(check_message(BlockNumber(11), r, h, r), Classification::FutureHeight);
    assert_eq!(check_message(BlockNumber(9), r, h, r), Classification::OldHeight);
    assert_eq!(check_message(h, RoundNumber(3), h, r), Classification::FutureRound);
    assert_eq!(check_message(h, RoundNumber(1), h, r), Classification::OldRound);
    assert_eq!(check_message(h, r, h, r), Classification::Ok);
  }

  #[test]
  fn future_height_backlog_evicts_furthest_height_first() {
    let mut backlog: Backlog<u8, u64> = Backlog::new();
    let mut evicted = vec![];
    for height in 0..MAX_FUTURE_HEIGHT_BACKLOG {
      assert_eq!(backlog.store_future_message(BlockNumber(height as u64), height as u64), None);
    }
    assert_eq!(backlog.future_len(), MAX_FUTURE_HEIGHT_BACKLOG);

    // One more, at the furthest height yet, should bump out the entry at the new maximum height
    // (itself), since it's the furthest ahead.
    let result = backlog.store_future_message(BlockNumber(MAX_FUTURE_HEIGHT_BACKLOG as u64), 999_999);
    evicted.extend(result);
    assert_eq!(backlog.future_len(), MAX_FUTURE_HEIGHT_BACKLOG);
    assert_eq!(evicted, vec![999_999]);
  }
}
