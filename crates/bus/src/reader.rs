//! Per-worker message reading.
//!
//! A `MessageReader` performs one end-to-end attempt per call: acquire a
//! read slot, receive one message, dispatch it, and report whether the
//! worker should keep going. `QueueReader` is the transport-backed
//! implementation; the trait seam exists so tests (and exotic consumers)
//! can script the pool's demand signal directly.

use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use async_trait::async_trait;
use carrier_transport::{TransactionContext, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::{coordinator::ReaderCoordinator, error::BusError};

/// Result of one `process_message` attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOutcome {
  /// A message was received and dispatched
  pub work_done: bool,
  /// The reader is stepping down; its worker exits
  pub removed: bool,
}

impl ReadOutcome {
  pub fn removed() -> Self {
    Self {
      work_done: false,
      removed: true,
    }
  }
}

/// One concurrent consumer of the queue, driven in a loop by its worker.
#[async_trait]
pub trait MessageReader: Send + Sync {
  /// Id of the worker this reader is bound to.
  fn task_id(&self) -> u64;

  /// One end-to-end attempt: read slot, receive, dispatch, outcome.
  ///
  /// Transport and dispatch failures are handled here; the only error a
  /// worker loop should ever see escape is cancellation.
  async fn process_message(&self, token: &CancellationToken) -> Result<ReadOutcome, BusError>;
}

/// User-supplied message processing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
  /// Process one message inside its transaction.
  ///
  /// Returning an error aborts the transaction, which returns the message
  /// to its queue on transactional transports.
  async fn handle(
    &self,
    message: carrier_core::Message,
    tx: &TransactionContext,
    token: &CancellationToken,
  ) -> anyhow::Result<()>;
}

/// Transport-backed reader: one receive-dispatch attempt per call.
pub struct QueueReader {
  task_id: u64,
  coordinator: Weak<dyn ReaderCoordinator>,
  transport: Arc<dyn Transport>,
  handler: Arc<dyn MessageHandler>,
  idle_backoff: Duration,
}

impl QueueReader {
  pub fn new(
    task_id: u64,
    coordinator: Weak<dyn ReaderCoordinator>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    idle_backoff: Duration,
  ) -> Self {
    Self {
      task_id,
      coordinator,
      transport,
      handler,
      idle_backoff,
    }
  }

  /// Sleep one backoff interval, waking early on cancellation.
  async fn backoff(&self, token: &CancellationToken) {
    tokio::select! {
      biased;
      _ = token.cancelled() => {}
      _ = tokio::time::sleep(self.idle_backoff) => {}
    }
  }
}

#[async_trait]
impl MessageReader for QueueReader {
  fn task_id(&self) -> u64 {
    self.task_id
  }

  async fn process_message(&self, token: &CancellationToken) -> Result<ReadOutcome, BusError> {
    // The coordinator owns us, not the other way around. If it is gone,
    // step down.
    let Some(coordinator) = self.coordinator.upgrade() else {
      return Ok(ReadOutcome::removed());
    };

    // Pause gate: a paused pool neither consumes nor drains.
    if coordinator.is_paused() && !token.is_cancelled() {
      self.backoff(token).await;
      return Ok(ReadOutcome::default());
    }

    let mut permit = coordinator.wait_read().await?;

    let tx = TransactionContext::new();
    let received = self.transport.receive(&tx, token).await;
    // The read slot covers the receive only; dispatch runs outside it.
    permit.release();

    let message = match received {
      Ok(message) => message,
      Err(e) => {
        let e = BusError::from(e);
        if e.is_cancelled() {
          return Err(BusError::Cancelled);
        }
        warn!(worker_id = self.task_id, error = %e, "receive failed, backing off");
        tx.abort();
        self.backoff(token).await;
        return Ok(ReadOutcome::default());
      }
    };

    let Some(message) = message else {
      tx.commit();
      let removed = coordinator.is_safe_to_remove_reader(self.task_id, false);
      if !removed {
        self.backoff(token).await;
      }
      return Ok(ReadOutcome {
        work_done: false,
        removed,
      });
    };

    // We have work: vacate the primary slot and let the coordinator put a
    // fresh prober on the queue while we dispatch. If this fails with
    // cancellation the abort hook returns the message to the queue.
    if let Err(e) = coordinator.on_before_do_work(self.task_id) {
      tx.abort();
      return Err(e);
    }

    let message_id = message.id;
    trace!(worker_id = self.task_id, %message_id, "dispatching");
    let dispatched = self.handler.handle(message, &tx, token).await;

    // Re-offer ourselves as primary whether or not dispatch succeeded.
    coordinator.on_after_do_work(self.task_id);

    match dispatched {
      Ok(()) => tx.commit(),
      Err(e) => {
        error!(worker_id = self.task_id, %message_id, error = %e, "dispatch failed, aborting transaction");
        tx.abort();
      }
    }

    Ok(ReadOutcome {
      work_done: true,
      removed: coordinator.is_safe_to_remove_reader(self.task_id, true),
    })
  }
}
