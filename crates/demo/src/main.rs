//! Demo: an elastic consumer pool draining a bursty producer.
//!
//! Sends three bursts of messages into an in-memory queue and logs how
//! the worker pool grows under load and decays back to a single prober
//! between bursts. Ctrl-c stops early; the bus always shuts down
//! gracefully.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use carrier_bus::{MessageBus, MessageHandler};
use carrier_core::{BusConfig, CoordinatorConfig, Message, QueueAddr};
use carrier_transport::{MemoryNetwork, TransactionContext};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
  async fn handle(&self, message: Message, _tx: &TransactionContext, _token: &CancellationToken) -> Result<()> {
    // Simulate a unit of work so the pool has a reason to grow.
    tokio::time::sleep(Duration::from_millis(40)).await;
    info!(
      message_id = %message.id,
      payload = %String::from_utf8_lossy(&message.payload),
      "handled"
    );
    Ok(())
  }
}

fn init_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
    .init();
}

#[tokio::main]
async fn main() -> Result<()> {
  init_logging();

  let queue = QueueAddr::new("work.main")?;
  let config = BusConfig {
    queue: queue.clone(),
    coordinator: CoordinatorConfig {
      name: "demo-pool".to_string(),
      max_workers: 8,
      max_read_parallelism: 4,
      shutdown_timeout_ms: 10_000,
      stop_grace_ms: 1_000,
      idle_backoff_ms: 50,
    },
  };

  let network = MemoryNetwork::new();
  let transport = Arc::new(network.transport(queue.clone()));
  let bus = Arc::new(MessageBus::new(config, transport, Arc::new(LoggingHandler)));

  bus.start();

  // Stop early on ctrl-c.
  let interrupted = CancellationToken::new();
  {
    let interrupted = interrupted.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupted");
        interrupted.cancel();
      }
    });
  }

  let coordinator = Arc::clone(bus.coordinator());
  for burst in 1..=3u32 {
    if interrupted.is_cancelled() {
      break;
    }

    info!(burst, "producing 20 messages");
    for i in 0..20u32 {
      bus.send(&queue, format!("burst-{burst}-msg-{i}")).await?;
    }

    // Watch the pool while the burst drains.
    for _ in 0..20 {
      if interrupted.is_cancelled() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
      info!(
        workers = coordinator.tasks_count(),
        free_tokens = coordinator.free_readers_available(),
        queued = network.depth(&queue).unwrap_or(0),
        "pool state"
      );
      if network.depth(&queue) == Some(0) && coordinator.tasks_count() <= 1 {
        break;
      }
    }
  }

  bus.dispose().await;
  info!("demo finished");
  Ok(())
}
