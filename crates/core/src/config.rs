//! Configuration for the coordinator and the bus facade.
//!
//! All sections deserialize with full defaults so a config file only needs
//! to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::QueueAddr;

// ============================================================================
// Coordinator Configuration
// ============================================================================

/// Tuning for the workers coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
  /// Human-readable coordinator name (appears in logs)
  pub name: String,

  /// Upper bound on concurrent workers (default: 4)
  pub max_workers: usize,

  /// Maximum simultaneous transport reads (default: 4)
  pub max_read_parallelism: usize,

  /// Bound on the graceful-stop wait in milliseconds (default: 30000)
  pub shutdown_timeout_ms: u64,

  /// Grace window at the start of stop, letting in-flight receives unwind
  /// before the worker wait begins (default: 1000)
  pub stop_grace_ms: u64,

  /// Sleep applied by an idle reader between probe attempts (default: 50)
  pub idle_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      name: "coordinator".to_string(),
      max_workers: 4,
      max_read_parallelism: 4,
      shutdown_timeout_ms: 30_000,
      stop_grace_ms: 1_000,
      idle_backoff_ms: 50,
    }
  }
}

impl CoordinatorConfig {
  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_millis(self.shutdown_timeout_ms)
  }

  pub fn stop_grace(&self) -> Duration {
    Duration::from_millis(self.stop_grace_ms)
  }

  pub fn idle_backoff(&self) -> Duration {
    Duration::from_millis(self.idle_backoff_ms)
  }
}

// ============================================================================
// Bus Configuration
// ============================================================================

/// Configuration for a message bus instance: the queue it consumes plus
/// the coordinator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
  /// Queue this bus consumes
  pub queue: QueueAddr,

  /// Worker-pool tuning
  pub coordinator: CoordinatorConfig,
}

impl Default for BusConfig {
  fn default() -> Self {
    Self {
      // new() only rejects empty/whitespace addresses, which this is not
      queue: QueueAddr::new("work.main").unwrap_or_else(|_| unreachable!()),
      coordinator: CoordinatorConfig::default(),
    }
  }
}
