use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Transition;

/// A named, valued label identifying a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
  pub name: String,
  pub value: String,
}

impl Tag {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.name, self.value)
  }
}

/// Identity of a resource within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of a worker process; tasks are routed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ProcessId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A lifecycle command for one resource of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub kind: String,
  pub command: Tag,
  pub resource_id: ResourceId,
  pub process_id: ProcessId,
  /// Start a new worker for `process_id` when none exists yet.
  #[serde(default)]
  pub bootstrap: bool,
  #[serde(default)]
  pub params: Value,
}

impl Task {
  /// A task that brings up a fresh worker process.
  pub fn bootstrap(kind: impl Into<String>, transition: Transition, resource_id: ResourceId) -> Self {
    Self {
      kind: kind.into(),
      command: transition.tag(),
      resource_id,
      process_id: ProcessId::generate(),
      bootstrap: true,
      params: Value::Null,
    }
  }

  /// A task for a worker that already exists.
  pub fn bound(
    kind: impl Into<String>,
    transition: Transition,
    process_id: ProcessId,
    resource_id: ResourceId,
  ) -> Self {
    Self {
      kind: kind.into(),
      command: transition.tag(),
      resource_id,
      process_id,
      bootstrap: false,
      params: Value::Null,
    }
  }

  pub fn with_params(mut self, params: Value) -> Self {
    self.params = params;
    self
  }

  pub fn transition(&self) -> Option<Transition> {
    Transition::from_tag(&self.command)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
  Ok,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
  pub status: Status,
  pub resource_change: bool,
  #[serde(default)]
  pub data: Value,
}

impl TaskResult {
  pub fn ok(resource_change: bool) -> Self {
    Self {
      status: Status::Ok,
      resource_change,
      data: Value::Null,
    }
  }

  pub fn failed(reason: impl Into<String>) -> Self {
    Self {
      status: Status::Failed,
      resource_change: false,
      data: Value::String(reason.into()),
    }
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = data;
    self
  }

  pub fn is_ok(&self) -> bool {
    self.status == Status::Ok
  }
}

/// First reply of a command whose outcome keeps arriving later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedResult {
  pub status: Status,
  pub resource_change: bool,
  #[serde(default)]
  pub immediate_result: Option<Value>,
}

impl DelayedResult {
  pub fn ok(resource_change: bool) -> Self {
    Self {
      status: Status::Ok,
      resource_change,
      immediate_result: None,
    }
  }
}

/// Notice that a worker process has left its run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessShutdownSequence {
  pub process_id: Option<ProcessId>,
  /// The stop was requested rather than caused by a failure.
  pub expected: bool,
  pub clean_shutdown: bool,
}

impl ProcessShutdownSequence {
  pub fn requested() -> Self {
    Self {
      process_id: None,
      expected: true,
      clean_shutdown: true,
    }
  }
}

/// Request to install a named patch on a worker's bus. The installed patch
/// selects on the delivered control alone and wraps the original handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
  pub process_id: ProcessId,
  pub patch: String,
  #[serde(default)]
  pub params: Value,
}

/// Payload exchanged between pipelines, orchestrator and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
  Task(Task),
  Result(TaskResult),
  Delayed(DelayedResult),
  Shutdown(ProcessShutdownSequence),
  Patch(PatchRequest),
  Data(Value),
}

impl Message {
  /// Process the message must be delivered to, for routed payloads.
  pub fn target_process(&self) -> Option<&ProcessId> {
    match self {
      Message::Task(task) => Some(&task.process_id),
      Message::Patch(request) => Some(&request.process_id),
      _ => None,
    }
  }

  /// Whether this reply reports a successful outcome.
  pub fn is_ok_outcome(&self) -> bool {
    match self {
      Message::Result(result) => result.status == Status::Ok,
      Message::Delayed(delayed) => delayed.status == Status::Ok,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_bootstrap_generates_process_id() {
    let a = Task::bootstrap("receiver", Transition::Allocate, ResourceId::new("r0"));
    let b = Task::bootstrap("receiver", Transition::Allocate, ResourceId::new("r0"));
    assert!(a.bootstrap);
    assert_ne!(a.process_id, b.process_id);
  }

  #[test]
  fn test_message_wire_format() {
    let message = Message::Result(TaskResult::failed("nope"));
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(
      json,
      json!({
        "type": "result",
        "body": { "status": "FAILED", "resource_change": false, "data": "nope" }
      })
    );
  }

  #[test]
  fn test_ok_outcome_detection() {
    assert!(Message::Result(TaskResult::ok(true)).is_ok_outcome());
    assert!(Message::Delayed(DelayedResult::ok(false)).is_ok_outcome());
    assert!(!Message::Result(TaskResult::failed("x")).is_ok_outcome());
    assert!(!Message::Data(json!(1)).is_ok_outcome());
  }

  #[test]
  fn test_target_process() {
    let task = Task::bound(
      "filter",
      Transition::Start,
      ProcessId::new("p1"),
      ResourceId::new("f"),
    );
    assert_eq!(
      Message::Task(task).target_process(),
      Some(&ProcessId::new("p1"))
    );
    assert_eq!(Message::Data(Value::Null).target_process(), None);
  }
}
