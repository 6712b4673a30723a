//! Rotary Channel
//!
//! Point-to-point, bidirectional transports between two endpoints. Every
//! transport implements [`Channel`]; the scheduler uses
//! [`Channel::receiver`] to tell apart channels it can multi-wait on
//! natively from those it has to poll.
//!
//! Two implementations are provided:
//! - [`PipeChannel`]: an in-memory duplex pipe built on crossbeam channels
//! - [`StreamChannel`]: newline-delimited JSON frames over a byte stream

mod error;
mod pipe;
mod stream;

use std::time::Duration;

pub use crossbeam_channel::Receiver;
pub use error::ChannelError;
pub use pipe::{PipeChannel, pipe};
pub use stream::{StreamChannel, TimeoutStream};

/// One endpoint of a point-to-point transport.
///
/// `send` must be callable from any thread while another thread blocks in
/// `recv_blocking`.
pub trait Channel<T>: Send + Sync {
  /// Transmit a value to the peer endpoint.
  fn send(&self, value: T) -> Result<(), ChannelError>;

  /// Wait for the next value.
  ///
  /// Returns `Ok(None)` when `timeout` elapses first. A `None` timeout
  /// blocks until a value arrives or the peer disconnects.
  fn recv_blocking(&self, timeout: Option<Duration>) -> Result<Option<T>, ChannelError>;

  /// The native receive handle, when this channel supports multi-waiting.
  fn receiver(&self) -> Option<&Receiver<T>> {
    None
  }

  /// Whether a value can be received without blocking.
  ///
  /// Only meaningful for bindable channels.
  fn is_ready(&self) -> bool {
    self.receiver().is_some_and(|rx| !rx.is_empty())
  }
}
