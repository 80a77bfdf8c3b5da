//! Per-attempt transaction scope with completion hooks.
//!
//! A `TransactionContext` covers one receive-dispatch attempt. Transports
//! register hooks on it instead of acting immediately: a send registers a
//! commit hook that performs the delivery, a receive registers an abort
//! hook that returns the message to its queue. Completion is idempotent —
//! whichever of `commit` or `abort` runs first wins, and each hook runs
//! at most once.

use std::mem;

use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

/// How a transaction completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
  Committed,
  Aborted,
}

enum TxState {
  Open { on_commit: Vec<Hook>, on_abort: Vec<Hook> },
  Complete(TxOutcome),
}

/// Transaction scope for a single transport attempt.
///
/// Dropping an open transaction aborts it, so a panic or an early return
/// in the middle of an attempt never loses the in-flight message.
pub struct TransactionContext {
  state: Mutex<TxState>,
}

impl Default for TransactionContext {
  fn default() -> Self {
    Self::new()
  }
}

impl TransactionContext {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(TxState::Open {
        on_commit: Vec::new(),
        on_abort: Vec::new(),
      }),
    }
  }

  /// Register a hook to run when the transaction commits.
  ///
  /// If the transaction already committed, the hook runs immediately; if
  /// it already aborted, the hook is dropped.
  pub fn on_committed(&self, hook: impl FnOnce() + Send + 'static) {
    let run_now = {
      let mut state = self.state.lock();
      match &mut *state {
        TxState::Open { on_commit, .. } => {
          on_commit.push(Box::new(hook));
          return;
        }
        TxState::Complete(TxOutcome::Committed) => true,
        TxState::Complete(TxOutcome::Aborted) => false,
      }
    };
    if run_now {
      hook();
    }
  }

  /// Register a hook to run when the transaction aborts.
  ///
  /// If the transaction already aborted, the hook runs immediately; if it
  /// already committed, the hook is dropped.
  pub fn on_aborted(&self, hook: impl FnOnce() + Send + 'static) {
    let run_now = {
      let mut state = self.state.lock();
      match &mut *state {
        TxState::Open { on_abort, .. } => {
          on_abort.push(Box::new(hook));
          return;
        }
        TxState::Complete(TxOutcome::Aborted) => true,
        TxState::Complete(TxOutcome::Committed) => false,
      }
    };
    if run_now {
      hook();
    }
  }

  /// Commit: run the commit hooks in registration order. No-op if the
  /// transaction already completed.
  pub fn commit(&self) {
    self.complete(TxOutcome::Committed);
  }

  /// Abort: run the abort hooks in registration order. No-op if the
  /// transaction already completed.
  pub fn abort(&self) {
    self.complete(TxOutcome::Aborted);
  }

  /// The completion outcome, or `None` while the transaction is open.
  pub fn outcome(&self) -> Option<TxOutcome> {
    match &*self.state.lock() {
      TxState::Open { .. } => None,
      TxState::Complete(outcome) => Some(*outcome),
    }
  }

  pub fn is_complete(&self) -> bool {
    self.outcome().is_some()
  }

  fn complete(&self, outcome: TxOutcome) {
    // Take the hooks out of the lock before running them: a hook may
    // register further hooks on this same transaction.
    let hooks = {
      let mut state = self.state.lock();
      match mem::replace(&mut *state, TxState::Complete(outcome)) {
        TxState::Open { on_commit, on_abort } => match outcome {
          TxOutcome::Committed => on_commit,
          TxOutcome::Aborted => on_abort,
        },
        TxState::Complete(previous) => {
          // Already completed: restore and bail.
          *state = TxState::Complete(previous);
          return;
        }
      }
    };

    for hook in hooks {
      hook();
    }
  }
}

impl Drop for TransactionContext {
  fn drop(&mut self) {
    self.abort();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use super::*;

  #[test]
  fn test_commit_runs_commit_hooks_once() {
    let tx = TransactionContext::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    tx.on_committed(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    tx.on_aborted(|| panic!("abort hook must not run on commit"));

    tx.commit();
    tx.commit();
    tx.abort();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(tx.outcome(), Some(TxOutcome::Committed));
  }

  #[test]
  fn test_abort_runs_abort_hooks() {
    let tx = TransactionContext::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    tx.on_aborted(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    tx.on_committed(|| panic!("commit hook must not run on abort"));

    tx.abort();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(tx.outcome(), Some(TxOutcome::Aborted));
  }

  #[test]
  fn test_late_registration_after_commit_runs_immediately() {
    let tx = TransactionContext::new();
    tx.commit();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    tx.on_committed(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    tx.on_aborted(|| panic!("dropped"));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_hooks_run_in_registration_order() {
    let tx = TransactionContext::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
      let o = order.clone();
      tx.on_committed(move || o.lock().push(i));
    }
    tx.commit();

    assert_eq!(*order.lock(), vec![0, 1, 2]);
  }

  #[test]
  fn test_drop_aborts_open_transaction() {
    let hits = Arc::new(AtomicUsize::new(0));
    {
      let tx = TransactionContext::new();
      let h = hits.clone();
      tx.on_aborted(move || {
        h.fetch_add(1, Ordering::SeqCst);
      });
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_hook_may_register_on_same_transaction() {
    let tx = Arc::new(TransactionContext::new());
    let hits = Arc::new(AtomicUsize::new(0));

    let tx2 = tx.clone();
    let h = hits.clone();
    tx.on_committed(move || {
      // Runs immediately: the transaction is already committed.
      tx2.on_committed(move || {
        h.fetch_add(1, Ordering::SeqCst);
      });
    });

    tx.commit();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
