//! Message envelope and queue addressing.
//!
//! Messages are opaque to the bus: the payload is a byte vector and the
//! headers are free-form string pairs. Transports move envelopes between
//! named queues; the coordinator and its readers never look inside.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Queue Addressing
// ============================================================================

/// Errors from queue-address validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
  #[error("queue address is empty")]
  Empty,
  #[error("queue address contains whitespace: {0:?}")]
  Whitespace(String),
}

/// Address of a named queue on a transport.
///
/// Addresses are case-preserving, non-empty, and contain no whitespace.
/// They serialize as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueAddr(String);

impl QueueAddr {
  /// Validate and construct a queue address.
  pub fn new(addr: impl Into<String>) -> Result<Self, AddrError> {
    let addr = addr.into();
    if addr.is_empty() {
      return Err(AddrError::Empty);
    }
    if addr.chars().any(char::is_whitespace) {
      return Err(AddrError::Whitespace(addr));
    }
    Ok(Self(addr))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for QueueAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for QueueAddr {
  type Err = AddrError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::new(s)
  }
}

impl TryFrom<String> for QueueAddr {
  type Error = AddrError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<QueueAddr> for String {
  fn from(addr: QueueAddr) -> Self {
    addr.0
  }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A transport-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
  /// Unique message id (for correlation in logs)
  pub id: Uuid,
  /// Queue the message is addressed to
  pub destination: QueueAddr,
  /// Free-form string headers
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub headers: BTreeMap<String, String>,
  /// Opaque payload bytes
  pub payload: Vec<u8>,
  /// When the envelope was created
  pub enqueued_at: DateTime<Utc>,
}

impl Message {
  /// Create a message addressed to `destination`.
  pub fn to(destination: QueueAddr, payload: impl Into<Vec<u8>>) -> Self {
    Self {
      id: Uuid::new_v4(),
      destination,
      headers: BTreeMap::new(),
      payload: payload.into(),
      enqueued_at: Utc::now(),
    }
  }

  /// Attach a header, replacing any previous value for the same key.
  pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(key.into(), value.into());
    self
  }

  pub fn header(&self, key: &str) -> Option<&str> {
    self.headers.get(key).map(String::as_str)
  }
}
