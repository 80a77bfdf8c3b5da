//! Fair bounded admission for concurrent transport reads.
//!
//! The bottleneck is a thin shell over `tokio::sync::Semaphore`, which
//! already provides the two properties the read path needs: waiters are
//! served in submission order, and a waiter that gives up (its acquire
//! future is dropped) never consumes a permit. The shell adds
//! cancellation-aware entry and a scoped permit whose release is
//! idempotent.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::BusError;

/// Fair, cancellable bounded admission gate of fixed capacity.
pub struct AsyncBottleneck {
  semaphore: Arc<Semaphore>,
  capacity: usize,
}

impl AsyncBottleneck {
  /// Create a bottleneck admitting at most `capacity` concurrent reads.
  ///
  /// A capacity of zero would deadlock every reader; it is clamped to 1.
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      semaphore: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  /// Wait for a read slot.
  ///
  /// Returns a scoped permit, or `Err(Cancelled)` if `token` fires while
  /// waiting. A cancelled waiter leaves the queue without taking a slot.
  pub async fn enter(&self, token: &CancellationToken) -> Result<ReadPermit, BusError> {
    tokio::select! {
      biased;
      _ = token.cancelled() => Err(BusError::Cancelled),
      permit = Arc::clone(&self.semaphore).acquire_owned() => {
        match permit {
          Ok(permit) => Ok(ReadPermit { permit: Some(permit) }),
          // The semaphore is never closed; if it somehow is, treat it as
          // shutdown.
          Err(_) => Err(BusError::Cancelled),
        }
      }
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Slots currently free.
  pub fn available(&self) -> usize {
    self.semaphore.available_permits()
  }
}

/// A held read slot. Dropping it releases the slot; `release` does the
/// same eagerly and is idempotent.
pub struct ReadPermit {
  permit: Option<OwnedSemaphorePermit>,
}

impl ReadPermit {
  pub fn release(&mut self) {
    self.permit.take();
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::sync::mpsc;

  use super::*;

  #[tokio::test]
  async fn test_capacity_bounds_outstanding_permits() {
    let bottleneck = AsyncBottleneck::new(2);
    let token = CancellationToken::new();

    let a = bottleneck.enter(&token).await.unwrap();
    let _b = bottleneck.enter(&token).await.unwrap();
    assert_eq!(bottleneck.available(), 0);

    // Third entry must wait until a permit is returned.
    let wait = tokio::time::timeout(Duration::from_millis(50), bottleneck.enter(&token));
    assert!(wait.await.is_err());

    drop(a);
    let _c = bottleneck.enter(&token).await.unwrap();
    assert_eq!(bottleneck.available(), 0);
  }

  #[tokio::test]
  async fn test_release_is_idempotent() {
    let bottleneck = AsyncBottleneck::new(1);
    let token = CancellationToken::new();

    let mut permit = bottleneck.enter(&token).await.unwrap();
    permit.release();
    assert_eq!(bottleneck.available(), 1);
    permit.release();
    assert_eq!(bottleneck.available(), 1);
    drop(permit);
    assert_eq!(bottleneck.available(), 1);
  }

  #[tokio::test]
  async fn test_waiters_granted_in_submission_order() {
    let bottleneck = Arc::new(AsyncBottleneck::new(2));
    let token = CancellationToken::new();

    // Fill both slots.
    let first = bottleneck.enter(&token).await.unwrap();
    let second = bottleneck.enter(&token).await.unwrap();

    // Queue five waiters in a known order.
    let (granted_tx, mut granted_rx) = mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for waiter in 0..5u32 {
      let bottleneck = Arc::clone(&bottleneck);
      let token = token.clone();
      let granted_tx = granted_tx.clone();
      handles.push(tokio::spawn(async move {
        let permit = bottleneck.enter(&token).await.unwrap();
        granted_tx.send(waiter).unwrap();
        // Hold briefly so grants are strictly sequential.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);
      }));
      // Let this waiter enqueue before the next one starts.
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(first);
    drop(second);

    let mut order = Vec::new();
    for _ in 0..5 {
      order.push(granted_rx.recv().await.unwrap());
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    for handle in handles {
      handle.await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_cancelled_waiter_takes_no_slot() {
    let bottleneck = Arc::new(AsyncBottleneck::new(1));
    let token = CancellationToken::new();

    let held = bottleneck.enter(&token).await.unwrap();

    let waiter_token = token.child_token();
    let waiter = {
      let bottleneck = Arc::clone(&bottleneck);
      let waiter_token = waiter_token.clone();
      tokio::spawn(async move { bottleneck.enter(&waiter_token).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    waiter_token.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(BusError::Cancelled)));

    // The abandoned wait must not have consumed the slot.
    drop(held);
    assert_eq!(bottleneck.available(), 1);
    let _next = bottleneck.enter(&token).await.unwrap();
  }
}
