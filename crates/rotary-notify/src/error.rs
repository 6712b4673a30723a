use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
  #[error("no update channel for key: {0}")]
  ChannelNotFound(String),

  #[error("update channel already exists for key: {0}")]
  ChannelExists(String),
}
