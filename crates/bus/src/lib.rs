//! The carrier bus: an elastic worker pool consuming a transport queue.
//!
//! # Architecture
//!
//! ```text
//! MessageBus (facade)
//!   └── WorkersCoordinator (lifecycle, worker accounting, primary election)
//!         ├── AsyncBottleneck (fair bounded admission for reads)
//!         └── worker tasks (one per start token)
//!               └── MessageReader (permit → receive → dispatch, via ReaderFactory)
//! ```
//!
//! The coordinator keeps at most `max_workers` tasks alive. Exactly one
//! reader at a time is the *primary* — the idle prober watching the
//! queue. When the prober actually finds work it steps out of the primary
//! slot, asks the coordinator to spawn a successor prober, and dispatches;
//! workers that find nothing (or that finish work without re-winning the
//! primary slot) step down, so the pool grows only under demonstrated
//! demand and decays back toward a single prober when the queue drains.

mod bottleneck;
mod bus;
mod coordinator;
mod error;
mod factory;
mod reader;

pub use bottleneck::{AsyncBottleneck, ReadPermit};
pub use bus::MessageBus;
pub use coordinator::{ReaderCoordinator, WorkersCoordinator};
pub use error::BusError;
pub use factory::{QueueReaderFactory, ReaderFactory};
pub use reader::{MessageHandler, MessageReader, QueueReader, ReadOutcome};
