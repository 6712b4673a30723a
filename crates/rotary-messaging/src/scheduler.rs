//! Multiplexed waiting over many channels.
//!
//! Sources whose channel exposes a native receive handle are waited on
//! together with a crossbeam [`Select`]; the others are polled with
//! [`MESSENGER_FALLBACK_TIMEOUT`] after the joint wait.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Select;
use parking_lot::Mutex;
use rotary_channel::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::MessagingError;

/// Timeout used whenever non-bindable sources have to be polled.
pub const MESSENGER_FALLBACK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

trait Source: Send {
  fn is_bindable(&self) -> bool;

  /// Add this source's receiver to `select`, if it has one.
  fn register<'a>(&'a self, select: &mut Select<'a>);

  fn is_ready(&self) -> bool;

  /// Receive once and hand the result to the callback.
  fn fire(&mut self, timeout: Option<Duration>) -> Result<(), MessagingError>;
}

struct ChannelSource<T, C: ?Sized, F> {
  channel: Arc<C>,
  callback: F,
  _value: PhantomData<fn() -> T>,
}

impl<T, C, F> Source for ChannelSource<T, C, F>
where
  T: Send + 'static,
  C: Channel<T> + ?Sized + 'static,
  F: FnMut(Option<T>) -> Result<(), MessagingError> + Send,
{
  fn is_bindable(&self) -> bool {
    self.channel.receiver().is_some()
  }

  fn register<'a>(&'a self, select: &mut Select<'a>) {
    if let Some(receiver) = self.channel.receiver() {
      select.recv(receiver);
    }
  }

  fn is_ready(&self) -> bool {
    self.channel.is_ready()
  }

  fn fire(&mut self, timeout: Option<Duration>) -> Result<(), MessagingError> {
    let value = self.channel.recv_blocking(timeout)?;
    (self.callback)(value)
  }
}

struct Registered {
  id: SourceId,
  timeout: Option<Duration>,
  source: Box<dyn Source>,
}

enum Change {
  Add(Registered),
  Remove(SourceId),
  Timeout(SourceId, Option<Duration>),
}

/// Cloneable access to a scheduler, usable from inside source callbacks.
///
/// Changes are queued and take effect at the start of the next iteration.
#[derive(Clone)]
pub struct SchedulerHandle {
  changes: Arc<Mutex<Vec<Change>>>,
  next_id: Arc<AtomicU64>,
  cancel: CancellationToken,
}

impl SchedulerHandle {
  /// Register a channel. `callback` receives every value, or `None` when a
  /// polled source timed out. `timeout` bounds the joint wait.
  pub fn add_source<T, C>(
    &self,
    channel: Arc<C>,
    callback: impl FnMut(Option<T>) -> Result<(), MessagingError> + Send + 'static,
    timeout: Option<Duration>,
  ) -> SourceId
  where
    T: Send + 'static,
    C: Channel<T> + ?Sized + 'static,
  {
    let id = SourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let source = ChannelSource {
      channel,
      callback,
      _value: PhantomData,
    };
    self.changes.lock().push(Change::Add(Registered {
      id,
      timeout,
      source: Box::new(source),
    }));
    id
  }

  pub fn remove_source(&self, id: SourceId) {
    self.changes.lock().push(Change::Remove(id));
  }

  pub fn set_source_timeout(&self, id: SourceId, timeout: Option<Duration>) {
    self.changes.lock().push(Change::Timeout(id, timeout));
  }

  /// Stop serving; the current iteration is the last.
  pub fn dispose(&self) {
    self.cancel.cancel();
  }

  pub fn is_disposed(&self) -> bool {
    self.cancel.is_cancelled()
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }
}

/// Waits on many channels at once and dispatches to their callbacks.
pub struct MessagingScheduler {
  sources: Vec<Registered>,
  handle: SchedulerHandle,
  bindable: Vec<usize>,
  polled: Vec<usize>,
  dirty: bool,
}

impl Default for MessagingScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl MessagingScheduler {
  pub fn new() -> Self {
    Self::with_cancellation(CancellationToken::new())
  }

  /// Create a scheduler that stops when `cancel` is cancelled.
  pub fn with_cancellation(cancel: CancellationToken) -> Self {
    Self {
      sources: Vec::new(),
      handle: SchedulerHandle {
        changes: Arc::new(Mutex::new(Vec::new())),
        next_id: Arc::new(AtomicU64::new(1)),
        cancel,
      },
      bindable: Vec::new(),
      polled: Vec::new(),
      dirty: true,
    }
  }

  pub fn handle(&self) -> SchedulerHandle {
    self.handle.clone()
  }

  pub fn add_source<T, C>(
    &mut self,
    channel: Arc<C>,
    callback: impl FnMut(Option<T>) -> Result<(), MessagingError> + Send + 'static,
    timeout: Option<Duration>,
  ) -> SourceId
  where
    T: Send + 'static,
    C: Channel<T> + ?Sized + 'static,
  {
    let id = self.handle.add_source(channel, callback, timeout);
    self.apply_changes();
    id
  }

  pub fn remove_source(&mut self, id: SourceId) {
    self.handle.remove_source(id);
    self.apply_changes();
  }

  pub fn set_source_timeout(&mut self, id: SourceId, timeout: Option<Duration>) {
    self.handle.set_source_timeout(id, timeout);
    self.apply_changes();
  }

  pub fn source_count(&mut self) -> usize {
    self.apply_changes();
    self.sources.len()
  }

  pub fn dispose(&self) {
    self.handle.dispose();
  }

  pub fn is_disposed(&self) -> bool {
    self.handle.is_disposed()
  }

  /// Iterate until disposed, yielding the outcome of each wait-and-dispatch
  /// round. Callback errors are yielded, not retried.
  pub fn serve_requests(&mut self) -> ServeRequests<'_> {
    ServeRequests { scheduler: self }
  }

  /// Serve until disposed, stopping at the first error.
  pub fn run(&mut self) -> Result<(), MessagingError> {
    for round in self.serve_requests() {
      round?;
    }
    Ok(())
  }

  fn apply_changes(&mut self) {
    let changes = std::mem::take(&mut *self.handle.changes.lock());
    for change in changes {
      match change {
        Change::Add(registered) => {
          debug!(source_id = %registered.id, bindable = registered.source.is_bindable(), "source added");
          self.sources.push(registered);
        }
        Change::Remove(id) => {
          self.sources.retain(|registered| registered.id != id);
          debug!(source_id = %id, "source removed");
        }
        Change::Timeout(id, timeout) => {
          if let Some(registered) = self.sources.iter_mut().find(|r| r.id == id) {
            registered.timeout = timeout;
          }
        }
      }
      self.dirty = true;
    }
  }

  fn partition(&mut self) {
    self.bindable.clear();
    self.polled.clear();
    for (index, registered) in self.sources.iter().enumerate() {
      if registered.source.is_bindable() {
        self.bindable.push(index);
      } else {
        self.polled.push(index);
      }
    }
    self.dirty = false;
  }

  fn joint_timeout(&self) -> Option<Duration> {
    if !self.polled.is_empty() {
      return Some(MESSENGER_FALLBACK_TIMEOUT);
    }
    self
      .bindable
      .iter()
      .filter_map(|&index| self.sources[index].timeout)
      .min()
  }

  fn tick(&mut self) -> Result<(), MessagingError> {
    self.apply_changes();
    if self.dirty {
      self.partition();
    }

    if self.sources.is_empty() {
      std::thread::sleep(MESSENGER_FALLBACK_TIMEOUT);
      return Ok(());
    }

    let ready = self.wait_bindable();
    for index in ready {
      self.sources[index].source.fire(Some(Duration::ZERO))?;
    }

    for position in 0..self.polled.len() {
      let index = self.polled[position];
      self.sources[index]
        .source
        .fire(Some(MESSENGER_FALLBACK_TIMEOUT))?;
    }

    Ok(())
  }

  /// Indices of bindable sources that can be received from.
  fn wait_bindable(&self) -> Vec<usize> {
    if self.bindable.is_empty() {
      return Vec::new();
    }

    let timeout = self.joint_timeout();
    let selected = {
      let mut select = Select::new();
      for &index in &self.bindable {
        self.sources[index].source.register(&mut select);
      }
      match timeout {
        Some(timeout) => select.ready_timeout(timeout).ok(),
        None => Some(select.ready()),
      }
    };

    let Some(selected) = selected else {
      trace!("scheduler wait timed out");
      return Vec::new();
    };

    self
      .bindable
      .iter()
      .enumerate()
      .filter(|&(position, &index)| position == selected || self.sources[index].source.is_ready())
      .map(|(_, &index)| index)
      .collect()
  }
}

/// Iterator returned by [`MessagingScheduler::serve_requests`].
pub struct ServeRequests<'a> {
  scheduler: &'a mut MessagingScheduler,
}

impl Iterator for ServeRequests<'_> {
  type Item = Result<(), MessagingError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.scheduler.is_disposed() {
      return None;
    }
    Some(self.scheduler.tick())
  }
}
