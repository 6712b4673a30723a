use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{ControlId, Envelope, MessagingError, ThreadId, Topic};

/// Callback invoked with the control whenever a message for it arrives.
///
/// The returned value becomes the reply payload when the control has
/// `reply_to_message` set.
pub type ReplyHandler<P> = Box<dyn FnMut(&mut Control<P>) -> Option<P> + Send>;

/// A control shared between the registry and whoever awaits its replies.
pub type SharedControl<P> = Arc<Mutex<Control<P>>>;

/// Where a control stands in its exchange.
pub enum Continuation<P> {
  /// No further deliveries are expected.
  Done,
  /// A single reply is awaited.
  AwaitingReply(ReplyHandler<P>),
  /// Additional deliveries may arrive on the same exchange.
  Streaming(ReplyHandler<P>),
}

impl<P> Continuation<P> {
  pub fn is_done(&self) -> bool {
    matches!(self, Continuation::Done)
  }

  pub fn is_streaming(&self) -> bool {
    matches!(self, Continuation::Streaming(_))
  }
}

impl<P> fmt::Debug for Continuation<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Continuation::Done => f.write_str("Done"),
      Continuation::AwaitingReply(_) => f.write_str("AwaitingReply"),
      Continuation::Streaming(_) => f.write_str("Streaming"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ReplyStatus<P> {
  /// Payload of the most recently received message.
  pub reply: Option<P>,
  /// Set while this side must not receive another message.
  pub feedback_pending: bool,
  pub topic: Option<Topic>,
  pub thread: Option<ThreadId>,
}

/// Result of advancing a control's continuation.
pub(crate) enum Step<P> {
  /// The control had no handler.
  Idle,
  /// The handler (or a patch) ran and produced this reply payload.
  Handled(Option<P>),
}

/// State of one side of a message exchange.
pub struct Control<P> {
  id: ControlId,
  pub reply_status: ReplyStatus<P>,
  thread_history: Vec<(Option<ThreadId>, Envelope<P>)>,
  continuation: Continuation<P>,
  rebound: bool,
  /// Send the handler's return value back to the peer after each delivery.
  pub reply_to_message: bool,
  /// Retain this control in the registry after the current delivery.
  pub keep_control: bool,
  this: Weak<Mutex<Control<P>>>,
}

impl<P> Control<P> {
  pub(crate) fn create(
    topic: Option<Topic>,
    thread: Option<ThreadId>,
    handler: Option<ReplyHandler<P>>,
    build_entry: impl FnOnce(ControlId) -> Envelope<P>,
  ) -> SharedControl<P> {
    let id = ControlId::next();
    let entry = build_entry(id);
    Arc::new_cyclic(|this| {
      Mutex::new(Control {
        id,
        reply_status: ReplyStatus {
          reply: None,
          feedback_pending: false,
          topic,
          thread: thread.clone(),
        },
        thread_history: vec![(thread, entry)],
        continuation: match handler {
          Some(handler) => Continuation::AwaitingReply(handler),
          None => Continuation::Done,
        },
        rebound: false,
        reply_to_message: false,
        keep_control: false,
        this: this.clone(),
      })
    })
  }

  pub fn id(&self) -> ControlId {
    self.id
  }

  /// Payload of the most recently received message.
  pub fn reply(&self) -> Option<&P> {
    self.reply_status.reply.as_ref()
  }

  pub fn topic(&self) -> Option<&str> {
    self.reply_status.topic.as_deref()
  }

  pub fn thread(&self) -> Option<&ThreadId> {
    self.reply_status.thread.as_ref()
  }

  pub fn history(&self) -> &[(Option<ThreadId>, Envelope<P>)] {
    &self.thread_history
  }

  pub fn continuation(&self) -> &Continuation<P> {
    &self.continuation
  }

  pub fn is_feedback_pending(&self) -> bool {
    self.reply_status.feedback_pending
  }

  /// Allow another delivery on this control.
  pub fn reset_feedback(&mut self) {
    self.reply_status.feedback_pending = false;
  }

  /// Replace the handler for subsequent deliveries.
  ///
  /// May be called from inside the running handler; the new handler takes
  /// effect once the current one returns.
  pub fn set_handler(&mut self, handler: ReplyHandler<P>) {
    self.continuation = Continuation::AwaitingReply(handler);
    self.rebound = true;
  }

  /// Drop the handler; later deliveries are recorded but not handled.
  pub fn clear_handler(&mut self) {
    self.continuation = Continuation::Done;
    self.rebound = true;
  }

  /// The shared handle of this control, for use after the current
  /// delivery. Locking it from inside this control's handler deadlocks.
  pub fn handle(&self) -> Result<SharedControl<P>, MessagingError> {
    self
      .this
      .upgrade()
      .ok_or(MessagingError::ControlDropped(self.id))
  }

  /// Source and target ids of an envelope sent back along the latest
  /// exchange in the history.
  pub(crate) fn reply_route(
    &self,
  ) -> Result<(Option<ControlId>, Option<ControlId>), MessagingError> {
    let (_, last) = self
      .thread_history
      .last()
      .ok_or(MessagingError::EmptyHistory(self.id))?;

    if last.target_control_id == Some(self.id) {
      Ok((last.target_control_id, last.source_control_id))
    } else {
      Ok((last.source_control_id, last.target_control_id))
    }
  }

  pub(crate) fn record(&mut self, envelope: Envelope<P>) {
    let thread = self.reply_status.thread.clone();
    self.thread_history.push((thread, envelope));
  }

  /// Run the current handler through `dispatch`, then settle the
  /// continuation: a rebinding made by the handler wins, otherwise the
  /// handler is kept and labelled by `keep_control`.
  pub(crate) fn step(
    &mut self,
    dispatch: impl FnOnce(&mut Control<P>, &mut ReplyHandler<P>) -> Option<P>,
  ) -> Step<P> {
    let mut handler = match std::mem::replace(&mut self.continuation, Continuation::Done) {
      Continuation::Done => return Step::Idle,
      Continuation::AwaitingReply(handler) | Continuation::Streaming(handler) => handler,
    };

    self.rebound = false;
    let reply = dispatch(self, &mut handler);

    let next = if self.rebound {
      std::mem::replace(&mut self.continuation, Continuation::Done)
    } else {
      Continuation::AwaitingReply(handler)
    };
    self.continuation = match next {
      Continuation::AwaitingReply(handler) | Continuation::Streaming(handler) => {
        if self.keep_control {
          Continuation::Streaming(handler)
        } else {
          Continuation::AwaitingReply(handler)
        }
      }
      Continuation::Done => Continuation::Done,
    };
    self.rebound = false;

    Step::Handled(reply)
  }
}

impl<P: fmt::Debug> fmt::Debug for Control<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Control")
      .field("id", &self.id)
      .field("reply_status", &self.reply_status)
      .field("continuation", &self.continuation)
      .field("reply_to_message", &self.reply_to_message)
      .field("keep_control", &self.keep_control)
      .field("history_len", &self.thread_history.len())
      .finish()
  }
}
