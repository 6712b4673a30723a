use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rotary_notify::{Distributor, SubscriptionId, Update, UpdateChannel};
use rotary_resource::{Message, Tag};
use tracing::{debug, error, info, warn};

use crate::{
  CommandProgress, CommandSequence, ContextChannel, LinearStageBuilder, ParameterMap,
  StageDescriptor, StageError, StageHandle,
};

/// A command the pipeline has sent.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
  pub stage: &'static str,
  pub name: String,
  pub tag: Tag,
  pub replies: usize,
  pub completed: bool,
}

/// Every command sent by one run, with channels announcing their fate.
///
/// Updates on all three channels are keyed by command name and emitted by
/// the stage that issued the command.
#[derive(Clone, Default)]
pub struct BuiltCommandList {
  records: Arc<Mutex<Vec<CommandRecord>>>,
  pub command_sent: UpdateChannel<Tag>,
  pub command_completed: UpdateChannel<Message>,
  pub command_incomplete: UpdateChannel<Message>,
}

impl BuiltCommandList {
  pub fn records(&self) -> Vec<CommandRecord> {
    self.records.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.records.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.lock().is_empty()
  }

  fn push(&self, record: CommandRecord) {
    self.records.lock().push(record);
  }

  fn update_last(&self, replies: usize, completed: bool) {
    if let Some(record) = self.records.lock().last_mut() {
      record.replies = replies;
      record.completed = completed;
    }
  }
}

struct ActiveStage {
  name: &'static str,
  handle: StageHandle,
  commands: CommandSequence,
}

struct ActiveCommand {
  progress: CommandProgress,
  channel: ContextChannel,
  subscription: SubscriptionId,
}

struct ProgressState {
  order: VecDeque<StageDescriptor>,
  current: Option<ActiveStage>,
  command: Option<ActiveCommand>,
  parameter_map: Option<ParameterMap>,
  started: bool,
  finished: bool,
  failure: Option<String>,
}

enum Notice {
  Sent(Update<Tag>, UpdateChannel<Tag>),
  Reply(Update<Message>),
  Completed(Update<Message>),
  Incomplete(Update<Message>),
  Finished(Update<ParameterMap>),
}

struct Shared {
  builder: LinearStageBuilder,
  target: &'static str,
  start: bool,
  state: Mutex<ProgressState>,
  processed: BuiltCommandList,
  completion: UpdateChannel<ParameterMap>,
  distributor: Distributor<Message>,
}

/// One run of a [`LinearStageBuilder`] towards a target stage.
///
/// Commands go out one at a time; the next one is sent once the current
/// command completed and, for streaming commands, once its exchange ended.
/// Cloning yields another handle to the same run.
#[derive(Clone)]
pub struct LinearBuilderProgress {
  shared: Arc<Shared>,
}

impl LinearBuilderProgress {
  pub(crate) fn new(
    builder: LinearStageBuilder,
    target: &'static str,
    order: Vec<StageDescriptor>,
    start: bool,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        builder,
        target,
        start,
        state: Mutex::new(ProgressState {
          order: order.into(),
          current: None,
          command: None,
          parameter_map: None,
          started: false,
          finished: false,
          failure: None,
        }),
        processed: BuiltCommandList::default(),
        completion: UpdateChannel::new(),
        distributor: Distributor::new(),
      }),
    }
  }

  /// Send the first command. Later ones follow from replies.
  pub fn go(&self) -> Result<(), StageError> {
    let mut notices = Vec::new();
    let result = {
      let mut state = self.shared.state.lock();
      if state.started {
        return Ok(());
      }
      state.started = true;
      info!(target_stage = self.shared.target, start = self.shared.start, "pipeline started");
      self.next_command(&mut state, &mut notices)
    };
    self.emit(notices);
    result
  }

  pub fn target(&self) -> &'static str {
    self.shared.target
  }

  pub fn processed_commands(&self) -> BuiltCommandList {
    self.shared.processed.clone()
  }

  pub fn completion_channel(&self) -> UpdateChannel<ParameterMap> {
    self.shared.completion.clone()
  }

  /// Replies of every command, keyed by command name.
  pub fn reply_distributor(&self) -> Distributor<Message> {
    self.shared.distributor.clone()
  }

  pub fn parameter_map(&self) -> Option<ParameterMap> {
    self.shared.state.lock().parameter_map.clone()
  }

  pub fn is_finished(&self) -> bool {
    self.shared.state.lock().finished
  }

  /// Why the run is halted, if it is. The failed exchange stays open and a
  /// later completing reply clears this and resumes the run.
  pub fn failure(&self) -> Option<String> {
    self.shared.state.lock().failure.clone()
  }

  fn on_reply(&self, update: &Update<Message>) {
    let mut notices = Vec::new();
    {
      let mut guard = self.shared.state.lock();
      let state = &mut *guard;
      let Some(active) = state.command.as_mut() else {
        warn!(key = %update.key, "reply without an active command");
        return;
      };

      let stage = active.progress.stage();
      let name = active.progress.command().name().to_string();
      let status = active.progress.record(update.value.clone());
      self
        .shared
        .processed
        .update_last(active.progress.reply_history().len(), status.completed);

      let keyed = Update::new(name.clone(), update.value.clone()).emitted_by(stage);
      notices.push(Notice::Reply(keyed.clone()));

      if !status.advances() {
        if status.context_ended {
          warn!(stage, command = %name, "command did not complete");
          state.failure = Some(format!("command {name} of stage {stage} did not complete"));
        }
        notices.push(Notice::Incomplete(keyed));
      } else {
        debug!(stage, command = %name, "command completed");
        active.channel.deregister_context();
        state.failure = None;
        notices.push(Notice::Completed(keyed));
        if let Some(done) = state.command.take() {
          done.channel.unsubscribe(done.subscription);
        }

        if let Some(active) = &state.current {
          let previous = state.parameter_map.take();
          let map = active.handle.lock().map_result(update, previous);
          self.shared.builder.add_parameters(map.clone(), None);
          state.parameter_map = Some(map);
        }

        if let Err(e) = self.next_command(state, &mut notices) {
          error!(error = %e, "pipeline stopped");
          state.failure = Some(e.to_string());
        }
      }
    }
    self.emit(notices);
  }

  fn next_command(
    &self,
    state: &mut ProgressState,
    notices: &mut Vec<Notice>,
  ) -> Result<(), StageError> {
    let builder = &self.shared.builder;
    loop {
      if state.current.is_none() {
        let Some(descriptor) = state.order.pop_front() else {
          state.finished = true;
          info!(target_stage = self.shared.target, "pipeline finished");
          let map = state.parameter_map.clone().unwrap_or_default();
          notices.push(Notice::Finished(
            Update::new(self.shared.target, map).emitted_by(self.shared.target),
          ));
          return Ok(());
        };

        let handle = builder.build_stage(&descriptor)?;
        builder.mark_reached(descriptor.name, &handle);
        let commands = handle.lock().command_sequence(self.shared.start);
        state.current = Some(ActiveStage {
          name: descriptor.name,
          handle,
          commands,
        });
      }

      let Some(active) = state.current.as_mut() else {
        continue;
      };
      let Some(command) = active.commands.next() else {
        builder.mark_exhausted(active.name);
        debug!(stage = active.name, "stage exhausted");
        state.current = None;
        continue;
      };

      let stage = active.name;
      let name = command.name().to_string();
      let tag = command.tag();
      let resource_id = command
        .as_resource_bound()
        .map(|bound| bound.target_resource_id().clone());
      let notify = builder.note_command(stage, resource_id);

      let channel = builder.context().send(command.message())?;
      let progress = self.clone();
      let subscription = channel.subscribe(move |update| progress.on_reply(update));

      self.shared.processed.push(CommandRecord {
        stage,
        name: name.clone(),
        tag: tag.clone(),
        replies: 0,
        completed: false,
      });
      debug!(stage, command = %name, tag = %tag, "command sent");
      notices.push(Notice::Sent(Update::new(name, tag).emitted_by(stage), notify));

      state.command = Some(ActiveCommand {
        progress: CommandProgress::new(stage, command),
        channel,
        subscription,
      });
      return Ok(());
    }
  }

  fn emit(&self, notices: Vec<Notice>) {
    for notice in notices {
      match notice {
        Notice::Sent(update, notify) => {
          self.shared.processed.command_sent.send(&update);
          notify.send(&update);
        }
        Notice::Reply(update) => {
          let distributed = self
            .shared
            .distributor
            .init_channel(&update.key, false)
            .and_then(|_| self.shared.distributor.update(&update));
          if let Err(e) = distributed {
            warn!(error = %e, "reply not distributed");
          }
        }
        Notice::Completed(update) => self.shared.processed.command_completed.send(&update),
        Notice::Incomplete(update) => self.shared.processed.command_incomplete.send(&update),
        Notice::Finished(update) => self.shared.completion.send(&update),
      }
    }
  }
}
