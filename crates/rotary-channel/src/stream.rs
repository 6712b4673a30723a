use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::net::TcpStream;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::{Channel, ChannelError};

/// Shortest read timeout handed to the OS; a zero timeout is rejected.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// A byte stream that can be split into reader and writer halves and read
/// with a timeout.
pub trait TimeoutStream: Read + Write + Send + Sized {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
  fn try_clone(&self) -> io::Result<Self>;
}

impl TimeoutStream for TcpStream {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    TcpStream::set_read_timeout(self, timeout)
  }

  fn try_clone(&self) -> io::Result<Self> {
    TcpStream::try_clone(self)
  }
}

#[cfg(unix)]
impl TimeoutStream for std::os::unix::net::UnixStream {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
  }

  fn try_clone(&self) -> io::Result<Self> {
    std::os::unix::net::UnixStream::try_clone(self)
  }
}

struct FrameReader<S> {
  reader: BufReader<S>,
  pending: Vec<u8>,
}

/// A channel exchanging newline-delimited JSON frames over a byte stream.
///
/// Not bindable: sockets are polled with a read timeout. Bytes of a frame
/// that is only partially received when a timeout fires are kept until the
/// rest of the frame arrives.
pub struct StreamChannel<T, S: TimeoutStream> {
  writer: Mutex<S>,
  reader: Mutex<FrameReader<S>>,
  _frame: PhantomData<fn(T) -> T>,
}

impl<T, S: TimeoutStream> StreamChannel<T, S> {
  pub fn new(stream: S) -> io::Result<Self> {
    let writer = stream.try_clone()?;
    Ok(Self {
      writer: Mutex::new(writer),
      reader: Mutex::new(FrameReader {
        reader: BufReader::new(stream),
        pending: Vec::new(),
      }),
      _frame: PhantomData,
    })
  }
}

impl<T, S> Channel<T> for StreamChannel<T, S>
where
  T: Serialize + DeserializeOwned,
  S: TimeoutStream,
{
  fn send(&self, value: T) -> Result<(), ChannelError> {
    let mut frame = serde_json::to_vec(&value)?;
    frame.push(b'\n');

    let mut writer = self.writer.lock();
    match writer.write_all(&frame).and_then(|_| writer.flush()) {
      Ok(()) => Ok(()),
      Err(e) if is_disconnect(&e) => Err(ChannelError::Disconnected),
      Err(e) => Err(ChannelError::Io(e)),
    }
  }

  fn recv_blocking(&self, timeout: Option<Duration>) -> Result<Option<T>, ChannelError> {
    let mut guard = self.reader.lock();
    let FrameReader { reader, pending } = &mut *guard;

    reader
      .get_ref()
      .set_read_timeout(timeout.map(|t| t.max(MIN_READ_TIMEOUT)))?;

    match reader.read_until(b'\n', pending) {
      Ok(0) => Err(ChannelError::Disconnected),
      Ok(_) if pending.last() != Some(&b'\n') => Err(ChannelError::Disconnected),
      Ok(_) => {
        let frame = std::mem::take(pending);
        trace!(bytes = frame.len(), "frame received");
        Ok(Some(serde_json::from_slice(&frame)?))
      }
      Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
      Err(e) if is_disconnect(&e) => Err(ChannelError::Disconnected),
      Err(e) => Err(ChannelError::Io(e)),
    }
  }
}

fn is_disconnect(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    ErrorKind::BrokenPipe
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionAborted
      | ErrorKind::UnexpectedEof
  )
}

#[cfg(all(test, unix))]
mod tests {
  use std::os::unix::net::UnixStream;

  use serde::Deserialize;

  use super::*;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Frame {
    seq: u32,
    body: String,
  }

  fn channel_pair() -> (
    StreamChannel<Frame, UnixStream>,
    StreamChannel<Frame, UnixStream>,
  ) {
    let (a, b) = UnixStream::pair().unwrap();
    (StreamChannel::new(a).unwrap(), StreamChannel::new(b).unwrap())
  }

  #[test]
  fn test_frames_cross_the_stream() {
    let (left, right) = channel_pair();
    left
      .send(Frame {
        seq: 1,
        body: "hello".to_string(),
      })
      .unwrap();
    left
      .send(Frame {
        seq: 2,
        body: "world".to_string(),
      })
      .unwrap();

    let first = right.recv_blocking(Some(Duration::from_secs(1))).unwrap();
    let second = right.recv_blocking(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(first.map(|f| f.seq), Some(1));
    assert_eq!(second.map(|f| f.body), Some("world".to_string()));
  }

  #[test]
  fn test_timeout_returns_none() {
    let (left, _right) = channel_pair();
    let received = left
      .recv_blocking(Some(Duration::from_millis(20)))
      .unwrap();
    assert!(received.is_none());
  }

  #[test]
  fn test_partial_frame_survives_timeout() {
    let (raw, other) = UnixStream::pair().unwrap();
    let channel: StreamChannel<Frame, UnixStream> = StreamChannel::new(other).unwrap();
    let mut raw = raw;

    raw.write_all(br#"{"seq":5,"bo"#).unwrap();
    let received = channel
      .recv_blocking(Some(Duration::from_millis(20)))
      .unwrap();
    assert!(received.is_none());

    raw.write_all(b"dy\":\"late\"}\n").unwrap();
    let received = channel
      .recv_blocking(Some(Duration::from_secs(1)))
      .unwrap();
    assert_eq!(
      received,
      Some(Frame {
        seq: 5,
        body: "late".to_string()
      })
    );
  }

  #[test]
  fn test_closed_peer_disconnects() {
    let (left, right) = channel_pair();
    drop(right);
    assert!(matches!(
      left.recv_blocking(Some(Duration::from_secs(1))),
      Err(ChannelError::Disconnected)
    ));
  }

  #[test]
  fn test_stream_is_not_bindable() {
    let (left, _right) = channel_pair();
    assert!(Channel::<Frame>::receiver(&left).is_none());
  }
}
