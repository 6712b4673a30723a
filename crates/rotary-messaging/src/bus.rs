use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rotary_channel::Channel;
use tracing::{debug, trace};

use crate::control::Step;
use crate::{
  Control, Envelope, MessagePatch, MessageThreadRegistry, MessagingError, ReplyHandler,
  SharedControl, ThreadId,
};

/// Identity of a registered listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

type Listener<P> = Arc<Mutex<dyn FnMut(&mut Control<P>) -> Option<P> + Send>>;
type SharedPatch<P> = Arc<Mutex<dyn MessagePatch<P>>>;

struct ListenerEntry<P> {
  id: ListenerId,
  topic: Option<String>,
  listener: Listener<P>,
}

struct BusInner<P> {
  channel: Arc<dyn Channel<Envelope<P>>>,
  listeners: Mutex<Vec<ListenerEntry<P>>>,
  patches: Mutex<Vec<SharedPatch<P>>>,
  next_listener: AtomicU64,
}

/// Topic-addressed messaging over one [`Channel`].
///
/// Outgoing messages either start a new exchange (`send_message`) or
/// continue one (`deferred_reply`). Incoming messages are routed by
/// `process_new_message`: to the control they target, or to the listeners
/// of their topic followed by the wildcard listeners.
///
/// Cloning yields another handle to the same bus.
pub struct MessageBus<P> {
  inner: Arc<BusInner<P>>,
}

impl<P> Clone for MessageBus<P> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<P: Clone + Send + 'static> MessageBus<P> {
  pub fn new(channel: impl Channel<Envelope<P>> + 'static) -> Self {
    Self::from_shared(Arc::new(channel))
  }

  pub fn from_shared(channel: Arc<dyn Channel<Envelope<P>>>) -> Self {
    Self {
      inner: Arc::new(BusInner {
        channel,
        listeners: Mutex::new(Vec::new()),
        patches: Mutex::new(Vec::new()),
        next_listener: AtomicU64::new(1),
      }),
    }
  }

  /// The underlying channel, for registering with a scheduler.
  pub fn channel(&self) -> Arc<dyn Channel<Envelope<P>>> {
    Arc::clone(&self.inner.channel)
  }

  /// Register a handler for new exchanges on `topic`, or on every topic
  /// when `topic` is `None`.
  pub fn add_listener(
    &self,
    topic: Option<&str>,
    listener: impl FnMut(&mut Control<P>) -> Option<P> + Send + 'static,
  ) -> ListenerId {
    let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
    let listener: Listener<P> = Arc::new(Mutex::new(listener));
    self.inner.listeners.lock().push(ListenerEntry {
      id,
      topic: topic.map(str::to_string),
      listener,
    });
    debug!(listener_id = %id, topic = ?topic, "listener added");
    id
  }

  pub fn remove_listener(&self, id: ListenerId) -> bool {
    let mut listeners = self.inner.listeners.lock();
    let before = listeners.len();
    listeners.retain(|entry| entry.id != id);
    before != listeners.len()
  }

  /// Install a patch. Patches are tried in installation order.
  pub fn patch(&self, patch: impl MessagePatch<P> + 'static) {
    let patch: SharedPatch<P> = Arc::new(Mutex::new(patch));
    self.inner.patches.lock().push(patch);
  }

  /// Send a message that expects no reply.
  pub fn post(&self, topic: Option<&str>, payload: Option<P>) -> Result<(), MessagingError> {
    self.inner.channel.send(Envelope::new(topic, payload))?;
    trace!(topic = ?topic, "message posted");
    Ok(())
  }

  /// Send a message and create the control that receives its replies.
  pub fn request(
    &self,
    topic: Option<&str>,
    payload: Option<P>,
    handler: ReplyHandler<P>,
  ) -> Result<SharedControl<P>, MessagingError> {
    let mut outgoing = Envelope::new(topic, payload);
    let control = Control::create(outgoing.topic.clone(), None, Some(handler), |id| {
      outgoing.source_control_id = Some(id);
      outgoing.clone()
    });

    let id = {
      let mut guard = control.lock();
      guard.reply_status.feedback_pending = guard.reply_to_message;
      guard.id()
    };

    self.inner.channel.send(outgoing)?;
    debug!(control_id = %id, topic = ?topic, "request sent");
    Ok(control)
  }

  /// Send a message, creating a reply control when a callback is given.
  pub fn send_message(
    &self,
    topic: Option<&str>,
    payload: Option<P>,
    reply_callback: Option<ReplyHandler<P>>,
  ) -> Result<Option<SharedControl<P>>, MessagingError> {
    match reply_callback {
      Some(handler) => self.request(topic, payload, handler).map(Some),
      None => self.post(topic, payload).map(|_| None),
    }
  }

  /// Receive one message from the channel and process it.
  pub fn recv_and_process_message(
    &self,
    registry: &MessageThreadRegistry<P>,
    timeout: Option<Duration>,
  ) -> Result<Option<Vec<SharedControl<P>>>, MessagingError> {
    let envelope = self.inner.channel.recv_blocking(timeout)?;
    self.process_new_message(registry, envelope)
  }

  /// Route an incoming envelope.
  ///
  /// Returns the controls that handled it, or `None` when there was no
  /// envelope.
  pub fn process_new_message(
    &self,
    registry: &MessageThreadRegistry<P>,
    envelope: Option<Envelope<P>>,
  ) -> Result<Option<Vec<SharedControl<P>>>, MessagingError> {
    let Some(envelope) = envelope else {
      return Ok(None);
    };

    if let Some(target) = envelope.target_control_id {
      let control = registry
        .get(target)
        .ok_or(MessagingError::UnknownControl(target))?;

      let keep = {
        let mut guard = control.lock();
        self.deliver(&mut guard, envelope)?;
        guard.keep_control
      };
      if !keep {
        registry.remove(target);
        trace!(control_id = %target, "control released");
      }
      return Ok(Some(vec![control]));
    }

    let listeners = self.listeners_for(envelope.topic.as_deref());
    let mut affected = Vec::with_capacity(listeners.len());

    for listener in listeners {
      let thread = self.generate_thread(registry, envelope.topic.as_deref());
      let mut incoming = envelope.clone();
      incoming.thread = Some(thread.clone());

      let handler: ReplyHandler<P> = Box::new(move |control: &mut Control<P>| {
        let mut listener = listener.lock();
        (&mut *listener)(control)
      });
      let control = Control::create(incoming.topic.clone(), Some(thread), Some(handler), |id| {
        incoming.target_control_id = Some(id);
        incoming.clone()
      });

      let keep = {
        let mut guard = control.lock();
        debug!(control_id = %guard.id(), topic = ?guard.topic(), "new exchange");
        self.deliver(&mut guard, incoming)?;
        guard.keep_control
      };
      if keep {
        registry.append(Arc::clone(&control));
      }
      affected.push(control);
    }

    Ok(Some(affected))
  }

  /// Deliver an envelope to a control.
  pub fn handle_message(
    &self,
    control: &SharedControl<P>,
    envelope: Envelope<P>,
  ) -> Result<(), MessagingError> {
    self.deliver(&mut control.lock(), envelope)
  }

  /// Send a further message along the control's latest exchange.
  ///
  /// Callable at any time after the exchange started, including from other
  /// threads, as long as the caller is not inside this control's handler.
  pub fn deferred_reply(
    &self,
    control: &mut Control<P>,
    payload: Option<P>,
  ) -> Result<(), MessagingError> {
    let (source, target) = control.reply_route()?;
    let envelope = Envelope {
      payload,
      topic: control.reply_status.topic.clone(),
      thread: control.reply_status.thread.clone(),
      source_control_id: source,
      target_control_id: target,
    };

    control.reply_status.feedback_pending = control.reply_to_message;
    control.keep_control = control.reply_to_message;

    self.inner.channel.send(envelope)?;
    trace!(control_id = %control.id(), target = ?target, "deferred reply sent");
    Ok(())
  }

  /// A thread token not used by any control of `topic` in `registry`.
  pub fn generate_thread(
    &self,
    registry: &MessageThreadRegistry<P>,
    topic: Option<&str>,
  ) -> ThreadId {
    loop {
      let thread = ThreadId::generate();
      if registry.thread_entries(topic, &thread).is_empty() {
        return thread;
      }
    }
  }

  fn listeners_for(&self, topic: Option<&str>) -> Vec<Listener<P>> {
    let listeners = self.inner.listeners.lock();
    let topical = listeners
      .iter()
      .filter(|entry| topic.is_some() && entry.topic.as_deref() == topic);
    let wildcard = listeners.iter().filter(|entry| entry.topic.is_none());
    topical
      .chain(wildcard)
      .map(|entry| Arc::clone(&entry.listener))
      .collect()
  }

  fn deliver(&self, control: &mut Control<P>, envelope: Envelope<P>) -> Result<(), MessagingError> {
    if control.is_feedback_pending() {
      return Err(MessagingError::FeedbackPending(control.id()));
    }

    control.reply_status.reply = envelope.payload.clone();

    if control.continuation().is_done() {
      control.keep_control = false;
      return Ok(());
    }

    if control.reply_status.thread.is_none() {
      control.reply_status.thread = envelope.thread.clone();
    }

    let reply = match control.step(|control, handler| self.dispatch(control, handler)) {
      Step::Handled(reply) => reply,
      Step::Idle => None,
    };

    let reply_envelope = control.reply_to_message.then(|| Envelope {
      payload: reply,
      topic: envelope.topic.clone(),
      thread: envelope.thread.clone(),
      source_control_id: envelope.target_control_id,
      target_control_id: envelope.source_control_id,
    });

    control.record(envelope);

    match reply_envelope {
      Some(reply_envelope) => {
        self.inner.channel.send(reply_envelope)?;
        trace!(control_id = %control.id(), "reply sent");
      }
      None if !control.keep_control => {
        control.reply_status.feedback_pending = true;
      }
      None => {}
    }

    Ok(())
  }

  fn dispatch(&self, control: &mut Control<P>, handler: &mut ReplyHandler<P>) -> Option<P> {
    let patches: Vec<SharedPatch<P>> = self.inner.patches.lock().iter().cloned().collect();
    let selected = patches.into_iter().find(|patch| patch.lock().selects(control));

    match selected {
      Some(patch) => {
        debug!(control_id = %control.id(), "patch applied");
        patch.lock().apply(control, handler)
      }
      None => handler(control),
    }
  }
}
