use rotary_messaging::MessagingError;
use thiserror::Error;

use crate::{Tag, TransitionError};

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error(transparent)]
  Transition(#[from] TransitionError),

  #[error("unknown command tag: {0}")]
  UnknownCommand(Tag),

  #[error("no handler registered for resource kind: {0}")]
  UnknownKind(String),

  #[error("no patch registered with name: {0}")]
  UnknownPatch(String),

  #[error("invalid task parameters: {0}")]
  InvalidParams(#[from] serde_json::Error),

  #[error("resource handler failed: {message}")]
  Handler { message: String },

  #[error("messaging error: {0}")]
  Messaging(#[from] MessagingError),
}

impl ResourceError {
  pub fn handler(message: impl Into<String>) -> Self {
    Self::Handler {
      message: message.into(),
    }
  }
}
