//! Shared helpers for pool integration tests.
//!
//! `ScriptedReaderFactory` drives the coordinator without a transport:
//! each reader follows the real reader protocol (read permit, primary
//! handoff, safe-to-remove consultation) but takes its "is there work"
//! answer from a script closure, which makes pool growth and decay
//! deterministic to test.

#![allow(dead_code)]

use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
  },
  time::Duration,
};

use async_trait::async_trait;
use carrier_bus::{BusError, MessageReader, ReadOutcome, ReaderCoordinator, ReaderFactory};
use tokio_util::sync::CancellationToken;

/// Answers "does the queue have work right now" for scripted readers.
pub type WorkScript = Arc<dyn Fn() -> bool + Send + Sync>;

/// A script with no work: the pool stays a single idle prober.
pub fn always_idle() -> WorkScript {
  Arc::new(|| false)
}

/// A script with unlimited work: the pool runs at its cap.
pub fn always_busy() -> WorkScript {
  Arc::new(|| true)
}

/// A script handing out exactly `n` work items, then idling.
pub fn work_items(n: usize) -> WorkScript {
  let claimed = Arc::new(AtomicUsize::new(0));
  Arc::new(move || {
    claimed
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c < n).then_some(c + 1))
      .is_ok()
  })
}

pub struct ScriptedReaderFactory {
  script: WorkScript,
  work_duration: Duration,
}

impl ScriptedReaderFactory {
  pub fn new(script: WorkScript, work_duration: Duration) -> Arc<Self> {
    Arc::new(Self { script, work_duration })
  }
}

impl ReaderFactory for ScriptedReaderFactory {
  fn create_reader(&self, task_id: u64, coordinator: Weak<dyn ReaderCoordinator>) -> Box<dyn MessageReader> {
    Box::new(ScriptedReader {
      task_id,
      coordinator,
      script: Arc::clone(&self.script),
      work_duration: self.work_duration,
    })
  }
}

struct ScriptedReader {
  task_id: u64,
  coordinator: Weak<dyn ReaderCoordinator>,
  script: WorkScript,
  work_duration: Duration,
}

#[async_trait]
impl MessageReader for ScriptedReader {
  fn task_id(&self) -> u64 {
    self.task_id
  }

  async fn process_message(&self, token: &CancellationToken) -> Result<ReadOutcome, BusError> {
    let Some(coordinator) = self.coordinator.upgrade() else {
      return Ok(ReadOutcome::removed());
    };

    let mut permit = coordinator.wait_read().await?;
    permit.release();

    if !(self.script)() {
      let removed = coordinator.is_safe_to_remove_reader(self.task_id, false);
      if !removed {
        probe_backoff(token).await;
      }
      return Ok(ReadOutcome {
        work_done: false,
        removed,
      });
    }

    coordinator.on_before_do_work(self.task_id)?;
    // Simulated dispatch: user code, deliberately not cancellation-aware.
    tokio::time::sleep(self.work_duration).await;
    coordinator.on_after_do_work(self.task_id);

    Ok(ReadOutcome {
      work_done: true,
      removed: coordinator.is_safe_to_remove_reader(self.task_id, true),
    })
  }
}

async fn probe_backoff(token: &CancellationToken) {
  tokio::select! {
    biased;
    _ = token.cancelled() => {}
    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
  }
}

/// Poll `check` until it returns true, or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
  let start = std::time::Instant::now();
  while start.elapsed() < timeout {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  false
}
