use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
  #[error("channel peer disconnected")]
  Disconnected,

  #[error("failed to encode or decode frame: {0}")]
  Codec(#[from] serde_json::Error),

  #[error("transport i/o error: {0}")]
  Io(#[from] std::io::Error),
}
