//! In-memory network of named queues.
//!
//! `MemoryNetwork` is a process-local fabric: every queue is a FIFO of
//! envelopes, and any number of `MemoryTransport` endpoints can bind to
//! it. Receives are non-blocking — an empty queue yields `None` and the
//! consumer applies its own backoff — which keeps the fabric free of
//! wakeup bookkeeping and makes test timing deterministic.

use std::{
  collections::{BTreeMap, VecDeque},
  sync::Arc,
};

use async_trait::async_trait;
use carrier_core::{Message, QueueAddr};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{TransactionContext, Transport, TransportError};

struct MemoryQueue {
  messages: Mutex<VecDeque<Message>>,
}

impl MemoryQueue {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      messages: Mutex::new(VecDeque::new()),
    })
  }
}

/// Process-local network of named FIFO queues.
pub struct MemoryNetwork {
  queues: DashMap<QueueAddr, Arc<MemoryQueue>>,
}

impl Default for MemoryNetwork {
  fn default() -> Self {
    Self { queues: DashMap::new() }
  }
}

impl MemoryNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Create a queue if it does not already exist. Idempotent.
  pub fn create_queue(&self, addr: &QueueAddr) {
    self.queues.entry(addr.clone()).or_insert_with(MemoryQueue::new);
  }

  /// Bind a transport endpoint consuming `local`.
  ///
  /// The local queue is created if missing.
  pub fn transport(self: &Arc<Self>, local: QueueAddr) -> MemoryTransport {
    self.create_queue(&local);
    MemoryTransport {
      network: Arc::clone(self),
      address: local,
    }
  }

  /// Number of messages waiting on `addr`, or `None` for an unknown queue.
  pub fn depth(&self, addr: &QueueAddr) -> Option<usize> {
    self.queues.get(addr).map(|q| q.messages.lock().len())
  }

  fn queue(&self, addr: &QueueAddr) -> Result<Arc<MemoryQueue>, TransportError> {
    self
      .queues
      .get(addr)
      .map(|q| Arc::clone(q.value()))
      .ok_or_else(|| TransportError::QueueNotFound(addr.clone()))
  }
}

/// A [`Transport`] endpoint over a [`MemoryNetwork`].
pub struct MemoryTransport {
  network: Arc<MemoryNetwork>,
  address: QueueAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
  fn address(&self) -> &QueueAddr {
    &self.address
  }

  async fn create_queue(&self, addr: &QueueAddr) -> Result<(), TransportError> {
    self.network.create_queue(addr);
    Ok(())
  }

  async fn send(&self, dest: &QueueAddr, message: Message, tx: &TransactionContext) -> Result<(), TransportError> {
    if tx.is_complete() {
      return Err(TransportError::TransactionComplete);
    }
    // Resolve the destination now so a bad address fails the send, not the
    // commit; delivery itself waits for the commit hook.
    let queue = self.network.queue(dest)?;
    let message_id = message.id;

    tx.on_committed(move || {
      queue.messages.lock().push_back(message);
    });
    trace!(dest = %dest, %message_id, "send staged");
    Ok(())
  }

  async fn receive(&self, tx: &TransactionContext, token: &CancellationToken) -> Result<Option<Message>, TransportError> {
    if token.is_cancelled() {
      return Err(TransportError::Cancelled);
    }
    if tx.is_complete() {
      return Err(TransportError::TransactionComplete);
    }

    let queue = self.network.queue(&self.address)?;
    let Some(message) = queue.messages.lock().pop_front() else {
      return Ok(None);
    };

    // If the attempt aborts, the message goes back where it came from.
    let requeue = Arc::clone(&queue);
    let returned = message.clone();
    tx.on_aborted(move || {
      requeue.messages.lock().push_front(returned);
    });

    trace!(queue = %self.address, message_id = %message.id, "received");
    Ok(Some(message))
  }

  async fn properties(&self, token: &CancellationToken) -> Result<BTreeMap<String, String>, TransportError> {
    if token.is_cancelled() {
      return Err(TransportError::Cancelled);
    }

    let mut props = BTreeMap::new();
    props.insert("address".to_string(), self.address.to_string());
    props.insert("queue_count".to_string(), self.network.queues.len().to_string());
    for entry in self.network.queues.iter() {
      let depth = entry.value().messages.lock().len();
      props.insert(format!("queue.{}.depth", entry.key()), depth.to_string());
    }
    Ok(props)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(s: &str) -> QueueAddr {
    QueueAddr::new(s).unwrap()
  }

  #[tokio::test]
  async fn test_send_delivers_on_commit_only() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    let tx = TransactionContext::new();
    transport
      .send(&addr("work.main"), Message::to(addr("work.main"), b"a".to_vec()), &tx)
      .await
      .unwrap();

    assert_eq!(network.depth(&addr("work.main")), Some(0));
    tx.commit();
    assert_eq!(network.depth(&addr("work.main")), Some(1));
  }

  #[tokio::test]
  async fn test_send_dropped_transaction_delivers_nothing() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    {
      let tx = TransactionContext::new();
      transport
        .send(&addr("work.main"), Message::to(addr("work.main"), b"a".to_vec()), &tx)
        .await
        .unwrap();
    }
    assert_eq!(network.depth(&addr("work.main")), Some(0));
  }

  #[tokio::test]
  async fn test_send_to_unknown_queue_fails() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    let tx = TransactionContext::new();
    let err = transport
      .send(&addr("nowhere"), Message::to(addr("nowhere"), vec![]), &tx)
      .await
      .unwrap_err();
    assert!(matches!(err, TransportError::QueueNotFound(_)));
  }

  #[tokio::test]
  async fn test_receive_empty_returns_none() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    let tx = TransactionContext::new();
    let token = CancellationToken::new();
    assert!(transport.receive(&tx, &token).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_abort_requeues_at_front() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    for payload in [b"first".to_vec(), b"second".to_vec()] {
      let tx = TransactionContext::new();
      transport
        .send(&addr("work.main"), Message::to(addr("work.main"), payload), &tx)
        .await
        .unwrap();
      tx.commit();
    }

    let token = CancellationToken::new();

    // Take the head, then abort: it must come back in front of "second".
    let tx = TransactionContext::new();
    let taken = transport.receive(&tx, &token).await.unwrap().unwrap();
    assert_eq!(taken.payload, b"first");
    tx.abort();
    assert_eq!(network.depth(&addr("work.main")), Some(2));

    let tx = TransactionContext::new();
    let again = transport.receive(&tx, &token).await.unwrap().unwrap();
    assert_eq!(again.payload, b"first");
    tx.commit();
    assert_eq!(network.depth(&addr("work.main")), Some(1));
  }

  #[tokio::test]
  async fn test_receive_cancelled() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));

    let token = CancellationToken::new();
    token.cancel();
    let tx = TransactionContext::new();
    assert!(matches!(
      transport.receive(&tx, &token).await,
      Err(TransportError::Cancelled)
    ));
  }

  #[tokio::test]
  async fn test_properties_reports_depths() {
    let network = MemoryNetwork::new();
    let transport = network.transport(addr("work.main"));
    network.create_queue(&addr("other"));

    let tx = TransactionContext::new();
    transport
      .send(&addr("other"), Message::to(addr("other"), vec![1]), &tx)
      .await
      .unwrap();
    tx.commit();

    let props = transport.properties(&CancellationToken::new()).await.unwrap();
    assert_eq!(props.get("address").map(String::as_str), Some("work.main"));
    assert_eq!(props.get("queue.other.depth").map(String::as_str), Some("1"));
    assert_eq!(props.get("queue.work.main.depth").map(String::as_str), Some("0"));
  }
}
