use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{NotifyError, SubscriptionId, Update, UpdateChannel};

/// Routes updates to per-key channels.
///
/// Every update also reaches the aggregate channel, whatever its key.
/// Cloning yields another handle to the same distributor.
pub struct Distributor<T> {
  channels: Arc<Mutex<HashMap<String, UpdateChannel<T>>>>,
  aggregate: UpdateChannel<T>,
}

impl<T> Clone for Distributor<T> {
  fn clone(&self) -> Self {
    Self {
      channels: Arc::clone(&self.channels),
      aggregate: self.aggregate.clone(),
    }
  }
}

impl<T: 'static> Default for Distributor<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: 'static> Distributor<T> {
  pub fn new() -> Self {
    Self {
      channels: Arc::new(Mutex::new(HashMap::new())),
      aggregate: UpdateChannel::new(),
    }
  }

  /// Create the channel for `key`, or return the existing one unless
  /// `fail_if_exists` is set.
  pub fn init_channel(
    &self,
    key: &str,
    fail_if_exists: bool,
  ) -> Result<UpdateChannel<T>, NotifyError> {
    let mut channels = self.channels.lock();
    if let Some(channel) = channels.get(key) {
      if fail_if_exists {
        return Err(NotifyError::ChannelExists(key.to_string()));
      }
      return Ok(channel.clone());
    }
    let channel = UpdateChannel::new();
    channels.insert(key.to_string(), channel.clone());
    Ok(channel)
  }

  /// The channel for `key`. Created on demand unless `must_exist` is set.
  pub fn channel(&self, key: &str, must_exist: bool) -> Result<UpdateChannel<T>, NotifyError> {
    if must_exist {
      return self
        .channels
        .lock()
        .get(key)
        .cloned()
        .ok_or_else(|| NotifyError::ChannelNotFound(key.to_string()));
    }
    self.init_channel(key, false)
  }

  pub fn subscribe(
    &self,
    key: &str,
    must_exist: bool,
    subscriber: impl FnMut(&Update<T>) + Send + 'static,
  ) -> Result<SubscriptionId, NotifyError> {
    Ok(self.channel(key, must_exist)?.subscribe(subscriber))
  }

  /// Subscribe to every update, whatever its key.
  pub fn subscribe_all(&self, subscriber: impl FnMut(&Update<T>) + Send + 'static) -> SubscriptionId {
    self.aggregate.subscribe(subscriber)
  }

  /// Distribute updates of `source` under `key`.
  pub fn add_source(&self, key: &str, source: &UpdateChannel<T>) -> SubscriptionId {
    let distributor = self.clone();
    let key = key.to_string();
    source.subscribe(move |update| {
      if let Ok(channel) = distributor.init_channel(&key, false) {
        channel.send(update);
      }
      distributor.aggregate.send(update);
    })
  }

  /// Deliver an update to the channel of its key.
  pub fn update(&self, update: &Update<T>) -> Result<(), NotifyError> {
    let channel = self
      .channels
      .lock()
      .get(&update.key)
      .cloned()
      .ok_or_else(|| NotifyError::ChannelNotFound(update.key.clone()))?;

    trace!(key = %update.key, "update distributed");
    channel.send(update);
    self.aggregate.send(update);
    Ok(())
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.channels.lock().keys().cloned().collect();
    keys.sort();
    keys
  }
}
