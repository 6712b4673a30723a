use rotary_messaging::{Control, MessageBus};
use serde_json::Value;

use crate::{DelayedResult, Message, ResourceError, TaskResult};

/// Called once with the replying control when a delayed result is
/// produced. It typically captures `control.handle()` and the bus to send
/// the eventual results with `deferred_reply`.
pub type DelayedCallback = Box<
  dyn FnOnce(&mut Control<Message>, &MessageBus<Message>) -> Result<Option<Value>, ResourceError>
    + Send,
>;

/// A delayed result together with the hook that arranges its follow-ups.
pub struct DelayedResultSource {
  pub status: DelayedResult,
  pub control_callback: DelayedCallback,
  /// Put the callback's return value into the first reply.
  pub send_immediate_result: bool,
}

impl DelayedResultSource {
  pub fn new(
    status: DelayedResult,
    control_callback: impl FnOnce(&mut Control<Message>, &MessageBus<Message>) -> Result<Option<Value>, ResourceError>
    + Send
    + 'static,
  ) -> Self {
    Self {
      status,
      control_callback: Box::new(control_callback),
      send_immediate_result: false,
    }
  }

  pub fn with_immediate_result(mut self) -> Self {
    self.send_immediate_result = true;
    self
  }
}

/// What a lifecycle handler reports.
pub enum Outcome {
  Result(TaskResult),
  Delayed(DelayedResultSource),
  /// Plain success or failure.
  Done(bool),
  /// Nothing to report; the command is acknowledged without a resource
  /// change.
  NoOp,
}

impl From<TaskResult> for Outcome {
  fn from(result: TaskResult) -> Self {
    Outcome::Result(result)
  }
}

impl From<DelayedResultSource> for Outcome {
  fn from(source: DelayedResultSource) -> Self {
    Outcome::Delayed(source)
  }
}

impl From<bool> for Outcome {
  fn from(done: bool) -> Self {
    Outcome::Done(done)
  }
}

impl From<()> for Outcome {
  fn from(_: ()) -> Self {
    Outcome::Done(true)
  }
}
