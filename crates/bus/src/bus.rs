//! MessageBus - thin facade over a transport and a workers coordinator.
//!
//! The bus wires the pieces together: it builds the default reader
//! factory for the configured queue, owns the coordinator, and exposes
//! plain send/start/stop. It adds no routing, retry, or priority logic.

use std::sync::Arc;

use carrier_core::{BusConfig, Message, QueueAddr};
use carrier_transport::{TransactionContext, Transport, TransportError};
use tracing::info;

use crate::{
  coordinator::WorkersCoordinator,
  factory::QueueReaderFactory,
  reader::MessageHandler,
};

/// A message bus consuming one queue with an elastic worker pool.
pub struct MessageBus {
  config: BusConfig,
  transport: Arc<dyn Transport>,
  coordinator: Arc<WorkersCoordinator>,
}

impl MessageBus {
  /// Build a bus over `transport`, dispatching messages to `handler`.
  pub fn new(config: BusConfig, transport: Arc<dyn Transport>, handler: Arc<dyn MessageHandler>) -> Self {
    let factory = Arc::new(QueueReaderFactory::new(
      Arc::clone(&transport),
      handler,
      config.coordinator.idle_backoff(),
    ));
    let coordinator = WorkersCoordinator::new(config.coordinator.clone(), factory);

    Self {
      config,
      transport,
      coordinator,
    }
  }

  /// Start consuming. Idempotent.
  pub fn start(&self) -> bool {
    info!(queue = %self.config.queue, "bus starting");
    self.coordinator.start()
  }

  /// Stop consuming, draining workers gracefully. Idempotent.
  pub async fn stop(&self) {
    self.coordinator.stop().await;
  }

  /// Stop and release everything, complaining if the drain overran.
  pub async fn dispose(&self) {
    self.coordinator.dispose().await;
  }

  /// Send one payload to `dest` in its own committed transaction.
  pub async fn send(&self, dest: &QueueAddr, payload: impl Into<Vec<u8>>) -> Result<(), TransportError> {
    let tx = TransactionContext::new();
    self.transport.send(dest, Message::to(dest.clone(), payload), &tx).await?;
    tx.commit();
    Ok(())
  }

  /// The queue this bus consumes.
  pub fn queue(&self) -> &QueueAddr {
    &self.config.queue
  }

  /// The worker pool, for observers and tuning.
  pub fn coordinator(&self) -> &Arc<WorkersCoordinator> {
    &self.coordinator
  }
}
