use rotary_channel::ChannelError;
use thiserror::Error;

use crate::ControlId;

#[derive(Debug, Error)]
pub enum MessagingError {
  #[error("channel error: {0}")]
  Channel(#[from] ChannelError),

  #[error("no control registered with id {0}")]
  UnknownControl(ControlId),

  #[error("control {0} received a message while its feedback is pending")]
  FeedbackPending(ControlId),

  #[error("control {0} has no thread history to reply from")]
  EmptyHistory(ControlId),

  #[error("control {0} is no longer alive")]
  ControlDropped(ControlId),

  #[error("source callback failed: {message}")]
  Callback { message: String },
}

impl MessagingError {
  pub fn callback(message: impl Into<String>) -> Self {
    Self::Callback {
      message: message.into(),
    }
  }
}
