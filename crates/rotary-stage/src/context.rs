use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rotary_messaging::{Control, MessageBus, MessageThreadRegistry, ReplyHandler};
use rotary_notify::{SubscriptionId, Update, UpdateChannel};
use rotary_resource::Message;
use tracing::debug;

use crate::StageError;

/// Where a pipeline sends its commands.
pub trait MessagingContext: Send + Sync {
  /// Open an exchange for `message`; replies arrive on the returned channel.
  fn send(&self, message: Message) -> Result<ContextChannel, StageError>;
}

/// Replies of one exchange, plus a flag telling the transport to let the
/// exchange go.
#[derive(Clone, Default)]
pub struct ContextChannel {
  updates: UpdateChannel<Message>,
  deregistered: Arc<AtomicBool>,
}

impl ContextChannel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, subscriber: impl FnMut(&Update<Message>) + Send + 'static) -> SubscriptionId {
    self.updates.subscribe(subscriber)
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self.updates.unsubscribe(id)
  }

  pub fn publish(&self, update: &Update<Message>) {
    self.updates.send(update);
  }

  /// No further replies are wanted.
  pub fn deregister_context(&self) {
    self.deregistered.store(true, Ordering::Release);
  }

  pub fn is_deregistered(&self) -> bool {
    self.deregistered.load(Ordering::Acquire)
  }
}

/// Sends every command as a bus request on one topic.
pub struct TopicMessagingContext {
  bus: MessageBus<Message>,
  topic: String,
  registry: MessageThreadRegistry<Message>,
}

impl TopicMessagingContext {
  pub fn new(
    bus: MessageBus<Message>,
    topic: impl Into<String>,
    registry: MessageThreadRegistry<Message>,
  ) -> Self {
    Self {
      bus,
      topic: topic.into(),
      registry,
    }
  }

  pub fn topic(&self) -> &str {
    &self.topic
  }

  pub fn registry(&self) -> &MessageThreadRegistry<Message> {
    &self.registry
  }
}

impl MessagingContext for TopicMessagingContext {
  fn send(&self, message: Message) -> Result<ContextChannel, StageError> {
    let channel = ContextChannel::new();
    let receiver = channel.clone();
    let topic = self.topic.clone();

    let handler: ReplyHandler<Message> = Box::new(move |control: &mut Control<Message>| {
      if receiver.is_deregistered() {
        control.keep_control = false;
        return None;
      }
      control.keep_control = true;
      if let Some(reply) = control.reply().cloned() {
        let key = control
          .thread()
          .map(|thread| thread.as_str().to_string())
          .unwrap_or_default();
        receiver.publish(&Update::new(key, reply).emitted_by(topic.clone()));
      }
      control.keep_control = !receiver.is_deregistered();
      None
    });

    let control = self.bus.request(Some(&self.topic), Some(message), handler)?;
    let id = control.lock().id();
    self.registry.append(control);
    debug!(control_id = %id, topic = %self.topic, "command exchange opened");
    Ok(channel)
  }
}
