use rotary_notify::Update;
use rotary_resource::{Message, PatchRequest, ProcessId, ResourceId, Task, Transition};
use rotary_stage::{
  Command, CommandSequence, FieldSpec, ParameterMap, PatchCommand, Stage, StageDescriptor,
  StageError, StageParameters, StageType, TaskCommand,
};
use serde_json::{Value, json};

use crate::{FILTER, PREVIEW, RECEIVER, TASK_LOG_PATCH};

/// Look up a stock stage by name.
pub fn stage_by_name(name: &str) -> Option<StageDescriptor> {
  match name {
    RECEIVER => Some(ReceiverStage::descriptor()),
    FILTER => Some(FilterStage::descriptor()),
    PREVIEW => Some(PreviewStage::descriptor()),
    _ => None,
  }
}

fn commands(commands: Vec<Box<dyn Command>>) -> CommandSequence {
  Box::new(commands.into_iter())
}

fn command(stage: &str, process_id: &ProcessId, resource_id: &ResourceId, transition: Transition) -> TaskCommand {
  TaskCommand::new(
    format!("{stage}.{}", transition.verb()),
    Task::bound(stage, transition, process_id.clone(), resource_id.clone()),
  )
}

fn stop_commands(stage: &str, process_id: Option<&ProcessId>, resource_id: &ResourceId) -> CommandSequence {
  let Some(process_id) = process_id else {
    return Box::new(std::iter::empty());
  };
  commands(vec![
    Box::new(command(stage, process_id, resource_id, Transition::Stop)),
    Box::new(command(stage, process_id, resource_id, Transition::Delete)),
  ])
}

/// Brings up the worker process and its frame source.
pub struct ReceiverStage {
  source: String,
  resource_id: ResourceId,
  /// Install the task log patch on the worker right after allocation.
  log_tasks: bool,
  process_id: Option<ProcessId>,
}

impl StageType for ReceiverStage {
  fn descriptor() -> StageDescriptor {
    StageDescriptor::new(RECEIVER, build_receiver)
      .field(FieldSpec::required("source"))
      .field(FieldSpec::optional("resource_id", RECEIVER))
      .field(FieldSpec::optional("log_tasks", false))
  }
}

fn build_receiver(params: StageParameters) -> Result<Box<dyn Stage>, StageError> {
  Ok(Box::new(ReceiverStage {
    source: params.value("source")?,
    resource_id: ResourceId::new(params.value::<String>("resource_id")?),
    log_tasks: params.value("log_tasks")?,
    process_id: None,
  }))
}

impl Stage for ReceiverStage {
  fn generated_parameters(&self) -> ParameterMap {
    let mut map = ParameterMap::new();
    if let Some(process_id) = &self.process_id {
      map.insert("process_id".into(), json!(process_id.as_str()));
    }
    map
  }

  fn command_sequence(&mut self, start: bool) -> CommandSequence {
    if !start {
      return stop_commands(RECEIVER, self.process_id.as_ref(), &self.resource_id);
    }
    let allocate = Task::bootstrap(RECEIVER, Transition::Allocate, self.resource_id.clone())
      .with_params(json!({ "source": self.source }));
    let process_id = allocate.process_id.clone();
    self.process_id = Some(process_id.clone());
    let mut sequence: Vec<Box<dyn Command>> = vec![Box::new(TaskCommand::new("receiver.allocate", allocate))];
    if self.log_tasks {
      sequence.push(Box::new(PatchCommand::new(
        "receiver.log_tasks",
        PatchRequest {
          process_id: process_id.clone(),
          patch: TASK_LOG_PATCH.to_string(),
          params: Value::Null,
        },
      )));
    }
    sequence.push(Box::new(command(RECEIVER, &process_id, &self.resource_id, Transition::Start)));
    commands(sequence)
  }

  fn map_result(&mut self, update: &Update<Message>, previous: Option<ParameterMap>) -> ParameterMap {
    let mut map = previous.unwrap_or_default();
    if let Message::Result(result) = &update.value {
      if let Some(source) = result.data.get("source") {
        map.insert("receiver_source".into(), source.clone());
      }
    }
    map
  }
}

/// Processing step running next to the receiver.
pub struct FilterStage {
  link: ProcessId,
  threshold: f64,
  resource_id: ResourceId,
}

impl StageType for FilterStage {
  fn descriptor() -> StageDescriptor {
    StageDescriptor::new(FILTER, build_filter)
      .field(FieldSpec::dependency("receiver", ReceiverStage::descriptor))
      .field(FieldSpec::derived("link", ReceiverStage::descriptor, "process_id"))
      .field(FieldSpec::optional("threshold", 0.5))
  }
}

fn build_filter(params: StageParameters) -> Result<Box<dyn Stage>, StageError> {
  params.dependency("receiver")?;
  Ok(Box::new(FilterStage {
    link: ProcessId::new(params.value::<String>("link")?),
    threshold: params.value("threshold")?,
    resource_id: ResourceId::new(FILTER),
  }))
}

impl Stage for FilterStage {
  fn command_sequence(&mut self, start: bool) -> CommandSequence {
    if !start {
      return stop_commands(FILTER, Some(&self.link), &self.resource_id);
    }
    let allocate = Task::bound(FILTER, Transition::Allocate, self.link.clone(), self.resource_id.clone())
      .with_params(json!({ "threshold": self.threshold }));
    commands(vec![
      Box::new(TaskCommand::new("filter.allocate", allocate)),
      Box::new(command(FILTER, &self.link, &self.resource_id, Transition::Start)),
    ])
  }

  fn map_result(&mut self, _update: &Update<Message>, previous: Option<ParameterMap>) -> ParameterMap {
    let mut map = previous.unwrap_or_default();
    map.insert("threshold".into(), json!(self.threshold));
    map
  }
}

/// Streams frames back to the pipeline until the last one arrives.
pub struct PreviewStage {
  link: ProcessId,
  frames: u32,
  resource_id: ResourceId,
}

impl StageType for PreviewStage {
  fn descriptor() -> StageDescriptor {
    StageDescriptor::new(PREVIEW, build_preview)
      .field(FieldSpec::dependency("filter", FilterStage::descriptor))
      .field(FieldSpec::derived("link", ReceiverStage::descriptor, "process_id"))
      .field(FieldSpec::optional("frames", 3))
  }
}

fn build_preview(params: StageParameters) -> Result<Box<dyn Stage>, StageError> {
  params.dependency("filter")?;
  Ok(Box::new(PreviewStage {
    link: ProcessId::new(params.value::<String>("link")?),
    frames: params.value("frames")?,
    resource_id: ResourceId::new(PREVIEW),
  }))
}

fn is_last_frame(reply: &Message, _history: &[Message]) -> bool {
  matches!(reply, Message::Data(frame) if frame["last"] == true)
}

impl Stage for PreviewStage {
  fn command_sequence(&mut self, start: bool) -> CommandSequence {
    if !start {
      return stop_commands(PREVIEW, Some(&self.link), &self.resource_id);
    }
    let stream = Task::bound(PREVIEW, Transition::Start, self.link.clone(), self.resource_id.clone())
      .with_params(json!({ "frames": self.frames }));
    commands(vec![
      Box::new(command(PREVIEW, &self.link, &self.resource_id, Transition::Allocate)),
      Box::new(TaskCommand::new("preview.start", stream).streaming(is_last_frame)),
    ])
  }

  fn map_result(&mut self, update: &Update<Message>, previous: Option<ParameterMap>) -> ParameterMap {
    let mut map = previous.unwrap_or_default();
    if let Message::Data(frame) = &update.value {
      map.insert("last_frame".into(), frame["frame"].clone());
    }
    map
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stage_by_name() {
    assert_eq!(stage_by_name("preview").map(|d| d.name), Some(PREVIEW));
    assert!(stage_by_name("encoder").is_none());
  }

  #[test]
  fn test_receiver_publishes_process_id_while_generating() {
    let mut stage = ReceiverStage {
      source: "cam0".into(),
      resource_id: ResourceId::new(RECEIVER),
      log_tasks: false,
      process_id: None,
    };
    assert!(stage.generated_parameters().is_empty());
    let names: Vec<String> = stage.command_sequence(true).map(|c| c.name().to_string()).collect();
    assert_eq!(names, vec!["receiver.allocate", "receiver.start"]);
    assert!(stage.generated_parameters().contains_key("process_id"));

    let stop: Vec<String> = stage.command_sequence(false).map(|c| c.name().to_string()).collect();
    assert_eq!(stop, vec!["receiver.stop", "receiver.delete"]);
  }

  #[test]
  fn test_receiver_can_request_task_log() {
    let mut stage = ReceiverStage {
      source: "cam0".into(),
      resource_id: ResourceId::new(RECEIVER),
      log_tasks: true,
      process_id: None,
    };
    let tags: Vec<String> = stage.command_sequence(true).map(|c| c.tag().to_string()).collect();
    assert_eq!(tags, vec!["process/allocate", "patch/task_log", "process/start"]);
  }
}
