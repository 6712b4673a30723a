use rotary_messaging::Control;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
  Message, Outcome, ProcessContext, ResourceError, State, Status, Task, TaskResult, Transition,
};

/// Runs one lifecycle task against a worker's resources and turns the
/// handler's outcome into the reply message.
pub struct ControlTask<'a> {
  task: &'a Task,
}

impl<'a> ControlTask<'a> {
  pub fn new(task: &'a Task) -> Self {
    Self { task }
  }

  /// Execute the task. Always produces a reply; failures of any kind are
  /// reported as a `FAILED` result.
  #[instrument(
    name = "control_task",
    skip(self, control, context),
    fields(
      kind = %self.task.kind,
      resource_id = %self.task.resource_id,
      command = %self.task.command,
    )
  )]
  pub fn run(&self, control: &mut Control<Message>, context: &mut ProcessContext) -> Message {
    control.reply_to_message = true;

    match self.execute(control, context) {
      Ok(reply) => reply,
      Err(e) => {
        warn!(error = %e, "task failed");
        Message::Result(TaskResult::failed(e.to_string()))
      }
    }
  }

  fn execute(
    &self,
    control: &mut Control<Message>,
    context: &mut ProcessContext,
  ) -> Result<Message, ResourceError> {
    let task = self.task;
    let transition = task
      .transition()
      .ok_or_else(|| ResourceError::UnknownCommand(task.command.clone()))?;

    let ProcessContext {
      process_id,
      resources,
      extensions,
      catalog,
      bus,
    } = context;

    let handler = catalog
      .handler_mut(&task.kind)
      .ok_or_else(|| ResourceError::UnknownKind(task.kind.clone()))?;

    let current = resources.state(&task.kind, &task.resource_id);
    let next = current.next(transition)?;

    let outcome = {
      let mut cx = ProcessContext::task_context(task, current, extensions, bus, process_id);
      match transition {
        Transition::Allocate => handler.allocate(&mut cx),
        Transition::Start => handler.start(&mut cx),
        Transition::Stop => handler.stop(&mut cx),
        Transition::Delete => handler.delete(&mut cx),
      }?
    };

    let reply = match outcome {
      Outcome::Result(result) => Message::Result(result),
      Outcome::Delayed(source) => {
        let immediate = (source.control_callback)(control, bus)?;
        let mut status = source.status;
        if source.send_immediate_result {
          status.immediate_result = immediate;
        }
        control.keep_control = true;
        Message::Delayed(status)
      }
      Outcome::Done(true) => Message::Result(TaskResult::ok(true)),
      Outcome::Done(false) => Message::Result(TaskResult {
        status: Status::Failed,
        resource_change: false,
        data: Value::Null,
      }),
      Outcome::NoOp => {
        warn!("handler reported no outcome, acknowledging without resource change");
        Message::Result(TaskResult::ok(false))
      }
    };

    if reply.is_ok_outcome() {
      resources
        .entry(&task.kind, &task.resource_id)
        .send(transition)?;
      debug!(from = %current, to = %next, "transition committed");

      if next == State::Removed {
        context.evict(&task.kind, &task.resource_id);
      }
    }

    Ok(reply)
  }
}

impl ProcessContext {
  /// Serve one delivery addressed to the worker: run tasks, install patch
  /// requests, ignore everything else.
  pub fn handle_message(&mut self, control: &mut Control<Message>) -> Option<Message> {
    match control.reply().cloned() {
      Some(Message::Task(task)) => Some(ControlTask::new(&task).run(control, self)),
      Some(Message::Patch(request)) => {
        control.reply_to_message = true;
        match self.catalog.build_patch(&request.patch, &request.params) {
          Ok(patch) => {
            self.bus.patch(patch);
            debug!(patch = %request.patch, "patch installed");
            Some(Message::Result(TaskResult::ok(false)))
          }
          Err(e) => {
            warn!(error = %e, "patch request failed");
            Some(Message::Result(TaskResult::failed(e.to_string())))
          }
        }
      }
      _ => None,
    }
  }
}
