use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::Update;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<Mutex<dyn FnMut(&Update<T>) + Send>>;

struct Subscribers<T> {
  entries: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
  next_id: AtomicU64,
}

/// Fan-out of updates to subscribers.
///
/// Cloning yields another handle to the same channel. Subscribers are
/// snapshotted at the start of every `send`, so a subscriber may
/// unsubscribe itself (or subscribe others) while it runs; such changes
/// apply from the next `send`. A subscriber must not send on a channel while
/// that same subscriber is running.
pub struct UpdateChannel<T> {
  inner: Arc<Subscribers<T>>,
}

impl<T> Clone for UpdateChannel<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: 'static> Default for UpdateChannel<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: 'static> UpdateChannel<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Subscribers {
        entries: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn subscribe(&self, subscriber: impl FnMut(&Update<T>) + Send + 'static) -> SubscriptionId {
    let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    let subscriber: Subscriber<T> = Arc::new(Mutex::new(subscriber));
    self.inner.entries.lock().push((id, subscriber));
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut entries = self.inner.entries.lock();
    let before = entries.len();
    entries.retain(|(entry, _)| *entry != id);
    before != entries.len()
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.entries.lock().len()
  }

  pub fn send(&self, update: &Update<T>) {
    let snapshot: Vec<Subscriber<T>> = self
      .inner
      .entries
      .lock()
      .iter()
      .map(|(_, subscriber)| Arc::clone(subscriber))
      .collect();

    for subscriber in snapshot {
      let mut subscriber = subscriber.lock();
      (&mut *subscriber)(update);
    }
  }

  /// Forward every update of this channel to `destination`.
  pub fn send_to(&self, destination: &UpdateChannel<T>) -> SubscriptionId {
    let destination = destination.clone();
    self.subscribe(move |update| destination.send(update))
  }

  /// Forward every update of `source` to this channel.
  pub fn receive_from(&self, source: &UpdateChannel<T>) -> SubscriptionId {
    source.send_to(self)
  }

  pub fn same_channel(&self, other: &UpdateChannel<T>) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_send_reaches_all_subscribers() {
    let channel = UpdateChannel::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
      let seen = Arc::clone(&seen);
      channel.subscribe(move |update: &Update<u32>| seen.lock().push((name, update.value)));
    }
    channel.send(&Update::new("k", 3));

    assert_eq!(*seen.lock(), vec![("a", 3), ("b", 3)]);
  }

  #[test]
  fn test_unsubscribe_inside_callback() {
    let channel: UpdateChannel<u32> = UpdateChannel::new();
    let calls = Arc::new(AtomicU64::new(0));
    let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

    let handle = channel.clone();
    let counter = Arc::clone(&calls);
    let id_slot = Arc::clone(&own_id);
    let id = channel.subscribe(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      if let Some(id) = *id_slot.lock() {
        handle.unsubscribe(id);
      }
    });
    *own_id.lock() = Some(id);

    channel.send(&Update::new("k", 1));
    channel.send(&Update::new("k", 2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.subscriber_count(), 0);
  }

  #[test]
  fn test_forwarding_between_channels() {
    let source: UpdateChannel<u32> = UpdateChannel::new();
    let sink = UpdateChannel::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&seen);
    sink.subscribe(move |update: &Update<u32>| collected.lock().push(update.value));

    sink.receive_from(&source);
    source.send(&Update::new("k", 9));
    assert_eq!(*seen.lock(), vec![9]);
  }
}
