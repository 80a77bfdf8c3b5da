//! WorkersCoordinator - elastic worker pool over a message queue
//!
//! The coordinator keeps up to `max_workers` concurrent reader tasks
//! alive, growing the pool only when a reader demonstrates demand and
//! letting it decay back toward a single idle prober when the queue
//! drains.
//!
//! # Design Principles
//!
//! - **Lock-free accounting**: worker capacity is a signed token bucket
//!   (`AtomicI64`), the live-worker registry is a `DashMap`, and the
//!   primary-prober election is a single CAS cell. No mutex sits on the
//!   spawn path.
//! - **Demand-driven growth**: the one *primary* reader probes the queue;
//!   the moment it obtains work it vacates the slot and asks for a
//!   successor prober, so the pool grows one worker per demonstrated
//!   message, never speculatively.
//! - **Cooperative shutdown**: a single `CancellationToken` generation
//!   governs the pool. Stop cancels it, waits a grace window for
//!   in-flight receives to unwind, then waits for workers up to
//!   `shutdown_timeout` and abandons any that overrun.
//! - **Exit accounting exactly once**: a worker's terminal block removes
//!   it from the registry and refunds its start token; the registry
//!   remove is the at-most-once gate, whichever path gets there first.
//!
//! # Invariants
//!
//! At every steady state `tasks_can_be_started + active_workers ==
//! max_workers`. The bucket may go *negative* after the cap is lowered —
//! that sign encodes how many excess workers still need to drain, so it
//! is never clamped.

use std::{
  panic::AssertUnwindSafe,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
  },
  time::Duration,
};

use async_trait::async_trait;
use carrier_core::CoordinatorConfig;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
  bottleneck::{AsyncBottleneck, ReadPermit},
  error::BusError,
  factory::ReaderFactory,
};

/// Vacant value of the primary-election cell. Worker ids start at 1.
const NO_PRIMARY: u64 = 0;

// ============================================================================
// Advanced Contract
// ============================================================================

/// The coordinator surface consumed by readers rather than by end users.
///
/// Readers hold this behind a `Weak` reference: they call back into the
/// coordinator but never extend its lifetime.
#[async_trait]
pub trait ReaderCoordinator: Send + Sync {
  /// Attempt to spawn one additional worker. Succeeds iff a start token
  /// could be taken from the bucket and the fresh id registered.
  fn start_new_task(&self) -> bool;

  /// Is `reader_id` the current primary prober?
  fn is_primary_reader(&self, reader_id: u64) -> bool;

  /// May `reader_id` step down? True iff cancellation is requested, OR
  /// the reader is not primary, OR the bucket is negative (excess drain).
  /// A primary reader within cap is never voluntarily removed, so at
  /// least one prober survives.
  fn is_safe_to_remove_reader(&self, reader_id: u64, work_done: bool) -> bool;

  /// Called by a reader after it received a message, before dispatch:
  /// vacates the primary slot, checks cancellation, and tries to put a
  /// successor prober on the queue. The ordering matters — cancellation
  /// is checked after the release but before the spawn attempt, so a
  /// stop racing with receipt never pays for a worker that would exit
  /// immediately.
  fn on_before_do_work(&self, reader_id: u64) -> Result<(), BusError>;

  /// Called after dispatch completes: the reader re-offers itself as
  /// primary, succeeding only if the slot is vacant.
  fn on_after_do_work(&self, reader_id: u64);

  /// Wait for a read slot at the bottleneck. Cancellation of the
  /// coordinator aborts the wait.
  async fn wait_read(&self) -> Result<ReadPermit, BusError>;

  /// The current cancellation token generation.
  fn token(&self) -> CancellationToken;

  fn is_paused(&self) -> bool;
}

// ============================================================================
// WorkersCoordinator
// ============================================================================

struct WorkerHandle {
  join: Option<JoinHandle<()>>,
}

/// Dynamic worker-pool scheduler driving concurrent queue consumption.
pub struct WorkersCoordinator {
  name: String,

  /// Weak self-handle passed to spawned workers and reader factories so
  /// neither extends the coordinator's lifetime.
  self_ref: Weak<WorkersCoordinator>,

  factory: Arc<dyn ReaderFactory>,
  bottleneck: AsyncBottleneck,

  /// Target upper bound on concurrent workers.
  max_workers: AtomicUsize,

  /// Signed start-token bucket. Steady state:
  /// `tasks_can_be_started + active_workers == max_workers`.
  tasks_can_be_started: AtomicI64,

  /// Monotonic worker-id source, reset at each start.
  task_id_seq: AtomicU64,

  /// Primary-prober election cell; `NO_PRIMARY` when vacant.
  primary_id: AtomicU64,

  started: AtomicBool,
  paused: AtomicBool,

  /// Cancellation source for the current started generation.
  cancel: Mutex<CancellationToken>,

  /// Live workers keyed by id. Removal from this map is the
  /// at-most-once gate for exit accounting.
  active_workers: DashMap<u64, WorkerHandle>,

  shutdown_timeout: Duration,
  stop_grace: Duration,
}

impl WorkersCoordinator {
  /// Create a coordinator. It owns the bottleneck and the worker set;
  /// the factory is injected and must outlive it.
  pub fn new(config: CoordinatorConfig, factory: Arc<dyn ReaderFactory>) -> Arc<Self> {
    Arc::new_cyclic(|self_ref| Self {
      name: config.name.clone(),
      self_ref: self_ref.clone(),
      factory,
      bottleneck: AsyncBottleneck::new(config.max_read_parallelism),
      max_workers: AtomicUsize::new(config.max_workers),
      tasks_can_be_started: AtomicI64::new(0),
      task_id_seq: AtomicU64::new(0),
      primary_id: AtomicU64::new(NO_PRIMARY),
      started: AtomicBool::new(false),
      paused: AtomicBool::new(false),
      cancel: Mutex::new(CancellationToken::new()),
      active_workers: DashMap::new(),
      shutdown_timeout: config.shutdown_timeout(),
      stop_grace: config.stop_grace(),
    })
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Transition from stopped to started and launch the initial prober.
  ///
  /// Idempotent: a second call returns true without side effects. Must be
  /// called from within a tokio runtime.
  pub fn start(&self) -> bool {
    if self
      .started
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return true;
    }

    *self.cancel.lock() = CancellationToken::new();
    self.task_id_seq.store(0, Ordering::SeqCst);
    self.primary_id.store(NO_PRIMARY, Ordering::SeqCst);
    self
      .tasks_can_be_started
      .store(self.max_workers.load(Ordering::SeqCst) as i64, Ordering::SeqCst);

    info!(
      coordinator = %self.name,
      max_workers = self.max_workers.load(Ordering::SeqCst),
      "starting"
    );

    if !self.start_new_task() {
      debug!(coordinator = %self.name, "no capacity for the initial prober");
    }
    true
  }

  /// Transition from started to stopped, draining the pool.
  ///
  /// Cancels the token generation, clears the pause flag, sleeps the
  /// grace window, then waits for workers up to `shutdown_timeout`.
  /// Workers that overrun are abandoned (logged, removed from the set).
  /// Never fails; idempotent.
  pub async fn stop(&self) {
    self.shutdown().await;
  }

  /// Stop and complain if the pool did not drain in time.
  ///
  /// Safe to call multiple times.
  pub async fn dispose(&self) {
    if !self.shutdown().await {
      warn!(coordinator = %self.name, "disposed before all workers finished");
    }
  }

  /// Returns true when every worker finished within the timeout.
  async fn shutdown(&self) -> bool {
    if self
      .started
      .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return true;
    }

    info!(coordinator = %self.name, workers = self.active_workers.len(), "stopping");

    self.cancellation_token().cancel();
    self.paused.store(false, Ordering::SeqCst);

    // Grace window: let in-flight receives observe the cancellation and
    // unwind before we start the worker wait.
    tokio::time::sleep(self.stop_grace).await;

    // Snapshot the draining generation. Workers that already exited have
    // removed themselves; handles we cannot see belong to workers that
    // are past their terminal block anyway.
    let mut ids = Vec::new();
    let mut joins = Vec::new();
    for mut entry in self.active_workers.iter_mut() {
      ids.push(*entry.key());
      if let Some(join) = entry.value_mut().join.take() {
        joins.push(join);
      }
    }

    let drained = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(joins))
      .await
      .is_ok();

    if !drained {
      warn!(
        coordinator = %self.name,
        abandoned = self.active_workers.len(),
        "shutdown timeout elapsed, abandoning workers"
      );
    }

    // Clear the drained generation and zero the bucket. Abandoned workers
    // that finish later find their registry entry gone and account
    // nothing.
    for id in &ids {
      self.active_workers.remove(id);
    }
    self.tasks_can_be_started.store(0, Ordering::SeqCst);

    info!(coordinator = %self.name, "stopped");
    drained
  }

  // ==========================================================================
  // Observers & Tuning
  // ==========================================================================

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }

  /// Number of live workers.
  pub fn tasks_count(&self) -> usize {
    self.active_workers.len()
  }

  /// Start tokens remaining. Negative after a cap reduction until the
  /// excess workers drain.
  pub fn free_readers_available(&self) -> i64 {
    self.tasks_can_be_started.load(Ordering::SeqCst)
  }

  pub fn max_workers(&self) -> usize {
    self.max_workers.load(Ordering::SeqCst)
  }

  /// Retarget the worker cap.
  ///
  /// The delta is applied to the token bucket atomically. Lowering the
  /// cap may drive the bucket negative; excess workers are not killed,
  /// they drain through the safe-to-remove policy. If the pool is
  /// started but empty, a prober is launched immediately.
  pub fn set_max_workers(&self, count: usize) {
    let old = self.max_workers.swap(count, Ordering::SeqCst);
    let delta = count as i64 - old as i64;
    if delta != 0 {
      self.tasks_can_be_started.fetch_add(delta, Ordering::SeqCst);
    }
    debug!(coordinator = %self.name, old, new = count, "worker cap changed");

    if self.started.load(Ordering::SeqCst) && self.active_workers.is_empty() {
      self.start_new_task();
    }
  }

  pub fn set_paused(&self, paused: bool) {
    self.paused.store(paused, Ordering::SeqCst);
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  /// The current cancellation token generation.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.lock().clone()
  }

  /// Slots currently free at the read bottleneck.
  pub fn read_slots_available(&self) -> usize {
    self.bottleneck.available()
  }

  // ==========================================================================
  // Primary Election
  // ==========================================================================

  /// Install `id` as primary iff the slot is vacant.
  fn try_become_primary(&self, id: u64) -> bool {
    self
      .primary_id
      .compare_exchange(NO_PRIMARY, id, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  /// Vacate the primary slot iff `id` holds it.
  fn release_primary(&self, id: u64) -> bool {
    self
      .primary_id
      .compare_exchange(id, NO_PRIMARY, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  // ==========================================================================
  // Worker Lifecycle
  // ==========================================================================

  /// Exit accounting: remove the worker and refund its start token.
  ///
  /// The registry remove is the at-most-once gate — whichever exit path
  /// gets here first performs both effects, every later attempt is a
  /// no-op. Workers abandoned by `stop` were already removed, so their
  /// late exits refund nothing into the next generation's bucket.
  fn finish_worker(&self, id: u64) {
    if self.active_workers.remove(&id).is_some() {
      self.tasks_can_be_started.fetch_add(1, Ordering::SeqCst);
      trace!(coordinator = %self.name, worker_id = id, "worker finished");
    }
  }
}

#[async_trait]
impl ReaderCoordinator for WorkersCoordinator {
  fn start_new_task(&self) -> bool {
    // Take a start token, but only while the bucket is positive.
    if self
      .tasks_can_be_started
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| (v > 0).then_some(v - 1))
      .is_err()
    {
      return false;
    }

    let token = self.cancellation_token();
    if token.is_cancelled() {
      // Draining: no new workers. Put the token back.
      self.tasks_can_be_started.fetch_add(1, Ordering::SeqCst);
      return false;
    }

    let id = self.task_id_seq.fetch_add(1, Ordering::SeqCst) + 1;

    // Register a placeholder under the fresh id before the task exists,
    // so the worker set always covers every launched worker.
    match self.active_workers.entry(id) {
      dashmap::mapref::entry::Entry::Occupied(_) => {
        // A collision on a fresh id means the sequence wrapped into a
        // live worker. Refund and keep the pool running.
        error!(coordinator = %self.name, worker_id = id, "worker id collision, refusing to spawn");
        self.tasks_can_be_started.fetch_add(1, Ordering::SeqCst);
        return false;
      }
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        vacant.insert(WorkerHandle { join: None });
      }
    }

    let join = tokio::spawn(run_worker(self.self_ref.clone(), id, token));

    // Swap the placeholder for the real handle. The entry may already be
    // gone if the worker raced to completion; that is fine.
    if let Some(mut entry) = self.active_workers.get_mut(&id) {
      entry.join = Some(join);
    }

    trace!(coordinator = %self.name, worker_id = id, "worker launched");
    true
  }

  fn is_primary_reader(&self, reader_id: u64) -> bool {
    self.primary_id.load(Ordering::SeqCst) == reader_id
  }

  fn is_safe_to_remove_reader(&self, reader_id: u64, _work_done: bool) -> bool {
    self.cancellation_token().is_cancelled()
      || !self.is_primary_reader(reader_id)
      || self.tasks_can_be_started.load(Ordering::SeqCst) < 0
  }

  fn on_before_do_work(&self, reader_id: u64) -> Result<(), BusError> {
    self.release_primary(reader_id);

    // Check cancellation after the release but before the spawn, so a
    // stop racing with a receipt never launches a worker that would exit
    // immediately.
    if self.cancellation_token().is_cancelled() {
      return Err(BusError::Cancelled);
    }

    if self.start_new_task() {
      trace!(coordinator = %self.name, worker_id = reader_id, "successor prober launched");
    }
    Ok(())
  }

  fn on_after_do_work(&self, reader_id: u64) {
    self.try_become_primary(reader_id);
  }

  async fn wait_read(&self) -> Result<ReadPermit, BusError> {
    let token = self.cancellation_token();
    self.bottleneck.enter(&token).await
  }

  fn token(&self) -> CancellationToken {
    self.cancellation_token()
  }

  fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }
}

impl Drop for WorkersCoordinator {
  fn drop(&mut self) {
    // Best effort: a coordinator dropped while started cannot wait, but
    // its workers hold weak references and observe the cancellation.
    if self.started.load(Ordering::SeqCst) {
      self.cancel.lock().cancel();
    }
  }
}

// ============================================================================
// Worker Loop
// ============================================================================

/// Worker task body: run the loop, then account the exit exactly once.
async fn run_worker(coordinator: Weak<WorkersCoordinator>, id: u64, token: CancellationToken) {
  let result = AssertUnwindSafe(worker_loop(coordinator.clone(), id, token)).catch_unwind().await;
  if let Err(panic) = result {
    error!(worker_id = id, panic = panic_message(&panic), "worker panicked");
  }

  // Terminal block for every exit path: normal completion, cancellation,
  // reader error, or panic. The registry remove inside finish_worker
  // keeps the accounting at-most-once.
  if let Some(coordinator) = coordinator.upgrade() {
    coordinator.release_primary(id);
    coordinator.finish_worker(id);
  }
}

async fn worker_loop(coordinator: Weak<WorkersCoordinator>, id: u64, token: CancellationToken) {
  if token.is_cancelled() {
    return;
  }

  let reader = {
    let Some(coordinator) = coordinator.upgrade() else { return };
    let advanced: Weak<dyn ReaderCoordinator> = coordinator.self_ref.clone();
    let reader = coordinator.factory.create_reader(id, advanced);
    // First worker to arrive takes the primary slot.
    coordinator.try_become_primary(id);
    reader
  };

  loop {
    if token.is_cancelled() {
      trace!(worker_id = id, "worker observed cancellation");
      break;
    }

    match reader.process_message(&token).await {
      Ok(outcome) if outcome.removed => {
        trace!(worker_id = id, "reader stepped down");
        break;
      }
      Ok(_) => {}
      Err(e) if e.is_cancelled() => break,
      Err(e) => {
        error!(worker_id = id, error = %e, "worker loop failed");
        break;
      }
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
  panic
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("unknown panic")
}

// ============================================================================
// Tests
// ============================================================================
