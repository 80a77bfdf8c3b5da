//! Bus error taxonomy.
//!
//! Cancellation is modelled as an error variant so it can flow through
//! `?` from any suspension point and be filtered at the worker boundary:
//! it is the one error that legitimately ends a worker and it is never
//! logged as a failure.

use carrier_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
  #[error("operation cancelled")]
  Cancelled,
  #[error(transparent)]
  Transport(#[from] TransportError),
}

impl BusError {
  /// True when this error is the shutdown path rather than a failure.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled | Self::Transport(TransportError::Cancelled))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cancellation_is_recognized_through_transport() {
    assert!(BusError::Cancelled.is_cancelled());
    assert!(BusError::from(TransportError::Cancelled).is_cancelled());
    assert!(!BusError::from(TransportError::TransactionComplete).is_cancelled());
  }
}
