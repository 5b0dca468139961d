//! Rendezvous used when the node is proposer for the current (H, R): bridges the asynchronous
//! external block builder to the moment the core needs a value to propose.
//!
//! A condition-variable rendezvous is cleanly replaced by a mutex-guarded single slot plus a
//! `Notify`, with readers polling the slot and the stop signal simultaneously rather than
//! blocking a whole OS thread.

use tokio::sync::{Mutex, Notify};

use crate::{BlockNumber, ext::Block};

pub struct BlockAwaiter<B: Block> {
  slot: Mutex<Option<(BlockNumber, B)>>,
  notify: Notify,
  stopped: std::sync::atomic::AtomicBool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Stopped;

impl<B: Block> BlockAwaiter<B> {
  pub fn new() -> Self {
    BlockAwaiter {
      slot: Mutex::new(None),
      notify: Notify::new(),
      stopped: std::sync::atomic::AtomicBool::new(false),
    }
  }

  /// Stores `block` as the value for `height`, waking any in-flight `value` call. Idempotent;
  /// replaces whatever was previously stored, even if it hadn't been consumed yet.
  pub async fn set_value(&self, height: BlockNumber, block: B) {
    let mut slot = self.slot.lock().await;
    *slot = Some((height, block));
    drop(slot);
    self.notify.notify_one();
  }

  /// Blocks until a stored value whose height equals `height` is available, or until `stop()`
  /// is called. A stored value for a different height is discarded and the wait continues.
  pub async fn value(&self, height: BlockNumber) -> Result<B, Stopped> {
    loop {
      if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Stopped);
      }

      {
        let mut slot = self.slot.lock().await;
        match slot.take() {
          Some((h, block)) if h == height => return Ok(block),
          // Stale value for a height we've already passed or haven't reached; drop it and keep
          // waiting.
          Some(_) => (),
          None => (),
        }
      }

      let notified = self.notify.notified();
      tokio::pin!(notified);
      // Re-check `stopped` after registering for notification to avoid missing a concurrent
      // `stop()` that fired between our first check and this await.
      if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Stopped);
      }
      notified.await;
    }
  }

  /// Causes an in-flight (or future) `value` call to return `Stopped` exactly once it observes
  /// this call.
  pub fn stop(&self) {
    self.stopped.store(true, std::sync::atomic::Ordering::Release);
    self.notify.notify_waiters();
  }
}

impl<B: Block> Default for BlockAwaiter<B> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Clone, Debug, PartialEq)]
  struct TestBlock(u64);
  impl Block for TestBlock {
    type Id = [u8; 1];
    fn id(&self) -> Self::Id {
      [self.0 as u8]
    }
  }

  #[tokio::test]
  async fn delivers_matching_height() {
    let awaiter = BlockAwaiter::new();
    awaiter.set_value(BlockNumber(5), TestBlock(5)).await;
    assert_eq!(awaiter.value(BlockNumber(5)).await, Ok(TestBlock(5)));
  }

  #[tokio::test]
  async fn discards_stale_height_and_waits() {
    let awaiter = std::sync::Arc::new(BlockAwaiter::new());
    awaiter.set_value(BlockNumber(4), TestBlock(4)).await;

    let waiter = {
      let awaiter = awaiter.clone();
      tokio::spawn(async move { awaiter.value(BlockNumber(5)).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    awaiter.set_value(BlockNumber(5), TestBlock(5)).await;

    assert_eq!(waiter.await.unwrap(), Ok(TestBlock(5)));
  }

  #[tokio::test]
  async fn stop_wakes_waiter() {
    let awaiter = std::sync::Arc::new(BlockAwaiter::<TestBlock>::new());
    let waiter = {
      let awaiter = awaiter.clone();
      tokio::spawn(async move { awaiter.value(BlockNumber(1)).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    awaiter.stop();

    assert_eq!(waiter.await.unwrap(), Err(Stopped));
  }
}
