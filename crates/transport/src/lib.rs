//! Transport contract and the in-memory network.
//!
//! A transport moves opaque [`Message`] envelopes between named queues.
//! Every operation runs inside a [`TransactionContext`]: sends are
//! buffered until commit, and a received message is returned to its queue
//! if the transaction aborts. The bus consumes this trait; it never
//! depends on a concrete transport.

use std::collections::BTreeMap;

use async_trait::async_trait;
use carrier_core::{Message, QueueAddr};
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod transaction;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use transaction::{TransactionContext, TxOutcome};

/// Errors from transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("queue {0} does not exist")]
  QueueNotFound(QueueAddr),
  #[error("transaction already completed")]
  TransactionComplete,
  #[error("operation cancelled")]
  Cancelled,
}

/// A message transport bound to a local queue address.
///
/// Implementations must be safe to call from arbitrary worker tasks.
#[async_trait]
pub trait Transport: Send + Sync {
  /// The queue this transport instance consumes.
  fn address(&self) -> &QueueAddr;

  /// Create a queue if it does not already exist. Idempotent.
  async fn create_queue(&self, addr: &QueueAddr) -> Result<(), TransportError>;

  /// Deliver `message` to `dest` when `tx` commits.
  async fn send(&self, dest: &QueueAddr, message: Message, tx: &TransactionContext) -> Result<(), TransportError>;

  /// Take one message from the local queue, or `None` when it is empty.
  ///
  /// The message is returned to the front of the queue if `tx` aborts.
  async fn receive(&self, tx: &TransactionContext, token: &CancellationToken) -> Result<Option<Message>, TransportError>;

  /// Transport diagnostics as string pairs (queue depths etc).
  async fn properties(&self, token: &CancellationToken) -> Result<BTreeMap<String, String>, TransportError>;
}
