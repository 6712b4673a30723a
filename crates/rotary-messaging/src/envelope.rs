use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub type Topic = String;

static NEXT_CONTROL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`Control`](crate::Control), unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlId(u64);

impl ControlId {
  pub(crate) fn next() -> Self {
    Self(NEXT_CONTROL_ID.fetch_add(1, Ordering::Relaxed))
  }

  pub fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ControlId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Conversation token, unique within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
  pub(crate) fn generate() -> Self {
    Self(uuid::Uuid::new_v4().simple().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for ThreadId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

impl fmt::Display for ThreadId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The unit transmitted over a channel.
///
/// A `None` target starts a new exchange on the receiving side; a set
/// target continues the exchange owned by that control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
  pub payload: Option<P>,
  pub topic: Option<Topic>,
  pub thread: Option<ThreadId>,
  pub source_control_id: Option<ControlId>,
  pub target_control_id: Option<ControlId>,
}

impl<P> Envelope<P> {
  pub fn new(topic: Option<&str>, payload: Option<P>) -> Self {
    Self {
      payload,
      topic: topic.map(str::to_string),
      thread: None,
      source_control_id: None,
      target_control_id: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_control_ids_increase() {
    let first = ControlId::next();
    let second = ControlId::next();
    assert!(second > first);
  }

  #[test]
  fn test_envelope_wire_format() {
    let mut envelope = Envelope::new(Some("task"), Some(42u32));
    envelope.target_control_id = Some(ControlId(7));

    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["topic"], "task");
    assert_eq!(json["payload"], 42);
    assert_eq!(json["target_control_id"], 7);
    assert!(json["source_control_id"].is_null());

    let back: Envelope<u32> = serde_json::from_value(json).unwrap();
    assert_eq!(back, envelope);
  }
}
