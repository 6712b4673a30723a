use rotary_resource::{Message, PatchRequest, ProcessId, Tag, Task};

/// One unit of work a stage sends out and tracks until completion.
pub trait Command: Send {
  /// Key under which replies are distributed.
  fn name(&self) -> &str;

  fn tag(&self) -> Tag;

  /// Payload sent to open the exchange.
  fn message(&self) -> Message;

  /// Whether `reply` (the latest of `history`) completes the command.
  fn task_completed(&self, reply: &Message, _history: &[Message]) -> bool {
    reply.is_ok_outcome()
  }

  fn as_resource_bound(&self) -> Option<&dyn ResourceBound> {
    None
  }

  fn as_streaming(&self) -> Option<&dyn StreamingCommand> {
    None
  }
}

/// A command addressed to one worker process.
pub trait ResourceBound {
  fn target_resource_id(&self) -> &ProcessId;
}

/// A command whose exchange stays open for several replies.
pub trait StreamingCommand {
  /// Whether no further replies are expected after `reply`.
  fn context_ended(&self, reply: &Message, history: &[Message]) -> bool;
}

type StreamPredicate = Box<dyn Fn(&Message, &[Message]) -> bool + Send>;

/// A lifecycle [`Task`] sent as a command.
pub struct TaskCommand {
  name: String,
  task: Task,
  stream_end: Option<StreamPredicate>,
}

impl TaskCommand {
  pub fn new(name: impl Into<String>, task: Task) -> Self {
    Self {
      name: name.into(),
      task,
      stream_end: None,
    }
  }

  /// Keep the exchange open until `context_ended` holds for a reply.
  pub fn streaming(
    mut self,
    context_ended: impl Fn(&Message, &[Message]) -> bool + Send + 'static,
  ) -> Self {
    self.stream_end = Some(Box::new(context_ended));
    self
  }

  pub fn task(&self) -> &Task {
    &self.task
  }
}

impl Command for TaskCommand {
  fn name(&self) -> &str {
    &self.name
  }

  fn tag(&self) -> Tag {
    self.task.command.clone()
  }

  fn message(&self) -> Message {
    Message::Task(self.task.clone())
  }

  fn as_resource_bound(&self) -> Option<&dyn ResourceBound> {
    Some(self)
  }

  fn as_streaming(&self) -> Option<&dyn StreamingCommand> {
    match self.stream_end {
      Some(_) => Some(self),
      None => None,
    }
  }
}

impl ResourceBound for TaskCommand {
  fn target_resource_id(&self) -> &ProcessId {
    &self.task.process_id
  }
}

impl StreamingCommand for TaskCommand {
  fn context_ended(&self, reply: &Message, history: &[Message]) -> bool {
    self
      .stream_end
      .as_ref()
      .is_none_or(|ended| ended(reply, history))
  }
}

/// Asks a worker to install one of its named patches.
pub struct PatchCommand {
  name: String,
  request: PatchRequest,
}

impl PatchCommand {
  pub fn new(name: impl Into<String>, request: PatchRequest) -> Self {
    Self {
      name: name.into(),
      request,
    }
  }
}

impl Command for PatchCommand {
  fn name(&self) -> &str {
    &self.name
  }

  fn tag(&self) -> Tag {
    Tag::new("patch", self.request.patch.clone())
  }

  fn message(&self) -> Message {
    Message::Patch(self.request.clone())
  }

  fn as_resource_bound(&self) -> Option<&dyn ResourceBound> {
    Some(self)
  }
}

impl ResourceBound for PatchCommand {
  fn target_resource_id(&self) -> &ProcessId {
    &self.request.process_id
  }
}

/// Where a command stands after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyProgress {
  pub completed: bool,
  /// The exchange expects no further replies.
  pub context_ended: bool,
}

impl ReplyProgress {
  /// The pipeline may move on to the next command.
  pub fn advances(&self) -> bool {
    self.completed && self.context_ended
  }
}

/// Reply bookkeeping for one sent command.
pub struct CommandProgress {
  stage: &'static str,
  command: Box<dyn Command>,
  reply_history: Vec<Message>,
  completed: bool,
}

impl CommandProgress {
  pub fn new(stage: &'static str, command: Box<dyn Command>) -> Self {
    Self {
      stage,
      command,
      reply_history: Vec::new(),
      completed: false,
    }
  }

  pub fn stage(&self) -> &'static str {
    self.stage
  }

  pub fn command(&self) -> &dyn Command {
    self.command.as_ref()
  }

  pub fn reply_history(&self) -> &[Message] {
    &self.reply_history
  }

  pub fn is_completed(&self) -> bool {
    self.completed
  }

  /// Record a reply. Completion is sticky; a non-streaming command has no
  /// context of its own to end.
  pub fn record(&mut self, reply: Message) -> ReplyProgress {
    self.reply_history.push(reply);
    let history = &self.reply_history;
    let Some(reply) = history.last() else {
      return ReplyProgress {
        completed: self.completed,
        context_ended: true,
      };
    };

    if !self.completed {
      self.completed = self.command.task_completed(reply, history);
    }
    let context_ended = self
      .command
      .as_streaming()
      .is_none_or(|streaming| streaming.context_ended(reply, history));

    ReplyProgress {
      completed: self.completed,
      context_ended,
    }
  }
}

#[cfg(test)]
mod tests {
  use rotary_resource::{DelayedResult, ResourceId, TaskResult, Transition};
  use serde_json::json;

  use super::*;

  fn task() -> Task {
    Task::bound(
      "receiver",
      Transition::Start,
      ProcessId::new("p"),
      ResourceId::new("r"),
    )
  }

  #[test]
  fn test_plain_command_ends_on_first_reply() {
    let mut progress = CommandProgress::new("receiver", Box::new(TaskCommand::new("start", task())));
    let failed = progress.record(Message::Result(TaskResult::failed("x")));
    assert!(!failed.completed);
    assert!(failed.context_ended);
    assert!(!failed.advances());

    let ok = progress.record(Message::Result(TaskResult::ok(true)));
    assert!(ok.advances());
    assert_eq!(progress.reply_history().len(), 2);
  }

  #[test]
  fn test_streaming_command_waits_for_end() {
    let command = TaskCommand::new("stream", task())
      .streaming(|reply, _| matches!(reply, Message::Data(value) if value["last"] == true));
    let mut progress = CommandProgress::new("preview", Box::new(command));

    let first = progress.record(Message::Delayed(DelayedResult::ok(true)));
    assert!(first.completed);
    assert!(!first.context_ended);

    let frame = progress.record(Message::Data(json!({ "last": false })));
    assert!(frame.completed);
    assert!(!frame.advances());

    let last = progress.record(Message::Data(json!({ "last": true })));
    assert!(last.advances());
  }

  #[test]
  fn test_task_command_is_resource_bound() {
    let command = TaskCommand::new("start", task());
    assert_eq!(
      command.as_resource_bound().map(|bound| bound.target_resource_id().clone()),
      Some(ProcessId::new("p"))
    );
    assert!(command.as_streaming().is_none());
    assert_eq!(command.tag(), Transition::Start.tag());
  }

  #[test]
  fn test_patch_command_targets_its_process() {
    let command = PatchCommand::new(
      "receiver.log_tasks",
      PatchRequest {
        process_id: ProcessId::new("p"),
        patch: "task_log".to_string(),
        params: json!(null),
      },
    );
    assert_eq!(command.tag().to_string(), "patch/task_log");
    assert!(matches!(command.message(), Message::Patch(request) if request.patch == "task_log"));
    assert_eq!(
      command.as_resource_bound().map(|bound| bound.target_resource_id().clone()),
      Some(ProcessId::new("p"))
    );

    let mut progress = CommandProgress::new("receiver", Box::new(command));
    assert!(progress.record(Message::Result(TaskResult::ok(false))).advances());
  }
}
