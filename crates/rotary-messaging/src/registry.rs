use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ControlId, SharedControl, ThreadId};

struct Entry<P> {
  id: ControlId,
  control: SharedControl<P>,
}

/// The live controls of one endpoint.
///
/// Cloning yields another handle to the same registry, so handlers can
/// append controls while a message is being processed.
pub struct MessageThreadRegistry<P> {
  entries: Arc<Mutex<Vec<Entry<P>>>>,
}

impl<P> Clone for MessageThreadRegistry<P> {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
    }
  }
}

impl<P> Default for MessageThreadRegistry<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P> MessageThreadRegistry<P> {
  pub fn new() -> Self {
    Self {
      entries: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn append(&self, control: SharedControl<P>) {
    let id = control.lock().id();
    self.entries.lock().push(Entry { id, control });
  }

  pub fn extend(&self, controls: impl IntoIterator<Item = SharedControl<P>>) {
    for control in controls {
      self.append(control);
    }
  }

  pub fn get(&self, id: ControlId) -> Option<SharedControl<P>> {
    self
      .entries
      .lock()
      .iter()
      .find(|entry| entry.id == id)
      .map(|entry| Arc::clone(&entry.control))
  }

  pub fn remove(&self, id: ControlId) -> Option<SharedControl<P>> {
    let mut entries = self.entries.lock();
    let index = entries.iter().position(|entry| entry.id == id)?;
    Some(entries.remove(index).control)
  }

  pub fn contains(&self, id: ControlId) -> bool {
    self.entries.lock().iter().any(|entry| entry.id == id)
  }

  /// Snapshot of the registered controls, in registration order.
  pub fn controls(&self) -> Vec<SharedControl<P>> {
    self
      .entries
      .lock()
      .iter()
      .map(|entry| Arc::clone(&entry.control))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Controls of `topic` that are currently on `thread`.
  ///
  /// Locks every control of the registry; must not be called while holding
  /// one of them.
  pub fn thread_entries(&self, topic: Option<&str>, thread: &ThreadId) -> Vec<SharedControl<P>> {
    self
      .controls()
      .into_iter()
      .filter(|control| {
        let control = control.lock();
        control.topic() == topic && control.thread() == Some(thread)
      })
      .collect()
  }
}
