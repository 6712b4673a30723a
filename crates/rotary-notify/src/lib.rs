//! Rotary Notify
//!
//! In-process fan-out of [`Update`]s. An [`UpdateChannel`] delivers every
//! update to its current subscribers; a [`Distributor`] routes updates to
//! channels by key and mirrors all of them to aggregate subscribers.

mod channel;
mod distributor;
mod error;

use serde::{Deserialize, Serialize};

pub use channel::{SubscriptionId, UpdateChannel};
pub use distributor::Distributor;
pub use error::NotifyError;

/// A keyed value, tagged with who emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update<T> {
  pub key: String,
  pub value: T,
  pub emitted_by: Option<String>,
}

impl<T> Update<T> {
  pub fn new(key: impl Into<String>, value: T) -> Self {
    Self {
      key: key.into(),
      value,
      emitted_by: None,
    }
  }

  pub fn emitted_by(mut self, emitter: impl Into<String>) -> Self {
    self.emitted_by = Some(emitter.into());
    self
  }
}
