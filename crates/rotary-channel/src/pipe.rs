use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{Channel, ChannelError};

/// One end of an in-memory duplex pipe.
///
/// Values sent on one endpoint are received on the other. Values are moved,
/// never serialized.
#[derive(Debug)]
pub struct PipeChannel<T> {
  tx: Sender<T>,
  rx: Receiver<T>,
}

/// Create a connected pair of pipe endpoints.
pub fn pipe<T>() -> (PipeChannel<T>, PipeChannel<T>) {
  let (left_tx, right_rx) = crossbeam_channel::unbounded();
  let (right_tx, left_rx) = crossbeam_channel::unbounded();
  (
    PipeChannel {
      tx: left_tx,
      rx: left_rx,
    },
    PipeChannel {
      tx: right_tx,
      rx: right_rx,
    },
  )
}

impl<T: Send> Channel<T> for PipeChannel<T> {
  fn send(&self, value: T) -> Result<(), ChannelError> {
    self.tx.send(value).map_err(|_| ChannelError::Disconnected)
  }

  fn recv_blocking(&self, timeout: Option<Duration>) -> Result<Option<T>, ChannelError> {
    match timeout {
      None => self
        .rx
        .recv()
        .map(Some)
        .map_err(|_| ChannelError::Disconnected),
      Some(timeout) if timeout.is_zero() => match self.rx.try_recv() {
        Ok(value) => Ok(Some(value)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
      },
      Some(timeout) => match self.rx.recv_timeout(timeout) {
        Ok(value) => Ok(Some(value)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
      },
    }
  }

  fn receiver(&self) -> Option<&Receiver<T>> {
    Some(&self.rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pipe_is_duplex() {
    let (left, right) = pipe::<u32>();
    left.send(1).unwrap();
    right.send(2).unwrap();

    assert_eq!(right.recv_blocking(None).unwrap(), Some(1));
    assert_eq!(left.recv_blocking(None).unwrap(), Some(2));
  }

  #[test]
  fn test_recv_times_out() {
    let (left, _right) = pipe::<u32>();
    let received = left
      .recv_blocking(Some(Duration::from_millis(10)))
      .unwrap();
    assert!(received.is_none());
  }

  #[test]
  fn test_zero_timeout_polls() {
    let (left, right) = pipe::<u32>();
    assert!(left.recv_blocking(Some(Duration::ZERO)).unwrap().is_none());
    right.send(7).unwrap();
    assert!(left.is_ready());
    assert_eq!(left.recv_blocking(Some(Duration::ZERO)).unwrap(), Some(7));
  }

  #[test]
  fn test_dropped_peer_disconnects() {
    let (left, right) = pipe::<u32>();
    drop(right);
    assert!(matches!(
      left.recv_blocking(None),
      Err(ChannelError::Disconnected)
    ));
    assert!(matches!(left.send(1), Err(ChannelError::Disconnected)));
  }

  #[test]
  fn test_pipe_is_bindable() {
    let (left, _right) = pipe::<u32>();
    assert!(left.receiver().is_some());
  }
}
