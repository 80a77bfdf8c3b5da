//! Reader construction seam.
//!
//! The coordinator never builds readers itself: a factory binds each
//! fresh worker id to a reader holding a weak back-reference to the
//! coordinator's advanced interface. Factories are called from arbitrary
//! worker tasks and must be thread-safe.

use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use carrier_transport::Transport;

use crate::{
  coordinator::ReaderCoordinator,
  reader::{MessageHandler, MessageReader, QueueReader},
};

/// Creates a [`MessageReader`] bound to a worker id.
pub trait ReaderFactory: Send + Sync {
  fn create_reader(&self, task_id: u64, coordinator: Weak<dyn ReaderCoordinator>) -> Box<dyn MessageReader>;
}

/// Default factory: transport-backed [`QueueReader`]s sharing one handler.
pub struct QueueReaderFactory {
  transport: Arc<dyn Transport>,
  handler: Arc<dyn MessageHandler>,
  idle_backoff: Duration,
}

impl QueueReaderFactory {
  pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn MessageHandler>, idle_backoff: Duration) -> Self {
    Self {
      transport,
      handler,
      idle_backoff,
    }
  }
}

impl ReaderFactory for QueueReaderFactory {
  fn create_reader(&self, task_id: u64, coordinator: Weak<dyn ReaderCoordinator>) -> Box<dyn MessageReader> {
    Box::new(QueueReader::new(
      task_id,
      coordinator,
      Arc::clone(&self.transport),
      Arc::clone(&self.handler),
      self.idle_backoff,
    ))
  }
}
