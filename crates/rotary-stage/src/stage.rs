use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rotary_notify::Update;
use rotary_resource::Message;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Command, StageError};

pub type ParameterMap = serde_json::Map<String, Value>;

/// Lazily produces a stage's descriptor; used to name stage types in fields.
pub type StageRef = fn() -> StageDescriptor;

pub type CommandSequence = Box<dyn Iterator<Item = Box<dyn Command>> + Send>;

pub type StageConstructor = fn(StageParameters) -> Result<Box<dyn Stage>, StageError>;

#[derive(Clone)]
pub enum FieldKind {
  /// Must be supplied by the global or the stage's own parameters.
  Required,
  Optional(Value),
  /// Receives the built instance of another stage.
  Dependency(StageRef),
  /// Filled from an output of another stage; a supplied value is only the
  /// fallback when that stage publishes nothing.
  Derived { stage: StageRef, output: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
  Required,
  Optional,
}

#[derive(Clone)]
pub struct FieldSpec {
  pub name: &'static str,
  pub kind: FieldKind,
}

impl FieldSpec {
  pub fn required(name: &'static str) -> Self {
    Self {
      name,
      kind: FieldKind::Required,
    }
  }

  pub fn optional(name: &'static str, default: impl Into<Value>) -> Self {
    Self {
      name,
      kind: FieldKind::Optional(default.into()),
    }
  }

  pub fn dependency(name: &'static str, stage: StageRef) -> Self {
    Self {
      name,
      kind: FieldKind::Dependency(stage),
    }
  }

  pub fn derived(name: &'static str, stage: StageRef, output: &'static str) -> Self {
    Self {
      name,
      kind: FieldKind::Derived { stage, output },
    }
  }
}

/// Static description of a stage type: its fields and how to build it.
#[derive(Clone)]
pub struct StageDescriptor {
  pub name: &'static str,
  pub fields: Vec<FieldSpec>,
  pub construct: StageConstructor,
}

impl fmt::Debug for StageDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let fields: Vec<&str> = self.fields.iter().map(|field| field.name).collect();
    f.debug_struct("StageDescriptor")
      .field("name", &self.name)
      .field("fields", &fields)
      .finish()
  }
}

impl StageDescriptor {
  pub fn new(name: &'static str, construct: StageConstructor) -> Self {
    Self {
      name,
      fields: Vec::new(),
      construct,
    }
  }

  pub fn field(mut self, field: FieldSpec) -> Self {
    self.fields.push(field);
    self
  }

  /// Stages this one depends on through dependency or derived fields.
  /// With `indirect`, their dependencies too, nearest first.
  pub fn dependent_stages(&self, indirect: bool) -> Vec<StageDescriptor> {
    let mut found: Vec<StageDescriptor> = Vec::new();
    self.collect_dependencies(indirect, &mut found);
    found
  }

  fn direct_dependencies(&self) -> Vec<StageDescriptor> {
    let mut direct: Vec<StageDescriptor> = Vec::new();
    for field in &self.fields {
      let stage = match &field.kind {
        FieldKind::Dependency(stage) => stage,
        FieldKind::Derived { stage, .. } => stage,
        _ => continue,
      };
      let descriptor = stage();
      if !direct.iter().any(|known| known.name == descriptor.name) {
        direct.push(descriptor);
      }
    }
    direct
  }

  fn collect_dependencies(&self, indirect: bool, found: &mut Vec<StageDescriptor>) {
    let direct = self.direct_dependencies();
    let mut fresh = Vec::new();
    for descriptor in direct {
      if descriptor.name == self.name || found.iter().any(|known| known.name == descriptor.name) {
        continue;
      }
      found.push(descriptor.clone());
      fresh.push(descriptor);
    }
    if indirect {
      for descriptor in fresh {
        descriptor.collect_dependencies(true, found);
      }
    }
  }

  /// Derived fields as `(field, source stage, source output)`.
  pub fn derived_parameters(&self) -> Vec<(&'static str, StageRef, &'static str)> {
    self
      .fields
      .iter()
      .filter_map(|field| match field.kind {
        FieldKind::Derived { stage, output } => Some((field.name, stage, output)),
        _ => None,
      })
      .collect()
  }

  pub fn defined_parameters(&self, kind: ParameterKind) -> Vec<&'static str> {
    self
      .fields
      .iter()
      .filter(|field| match (&field.kind, kind) {
        (FieldKind::Required, ParameterKind::Required) => true,
        (FieldKind::Optional(_), ParameterKind::Optional) => true,
        _ => false,
      })
      .map(|field| field.name)
      .collect()
  }
}

/// Implemented by stage types to expose their static descriptor.
pub trait StageType {
  fn descriptor() -> StageDescriptor;
}

pub trait Stage: Send {
  /// Outputs published for derived fields of downstream stages.
  fn generated_parameters(&self) -> ParameterMap {
    ParameterMap::new()
  }

  fn command_sequence(&mut self, start: bool) -> CommandSequence;

  /// Fold a command reply into the pipeline parameter map.
  fn map_result(&mut self, _update: &Update<Message>, previous: Option<ParameterMap>) -> ParameterMap {
    previous.unwrap_or_default()
  }
}

/// A built stage instance shared between the builder and dependents.
#[derive(Clone)]
pub struct StageHandle {
  name: &'static str,
  inner: Arc<Mutex<Box<dyn Stage>>>,
}

impl fmt::Debug for StageHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StageHandle").field("name", &self.name).finish()
  }
}

impl StageHandle {
  pub fn new(name: &'static str, stage: Box<dyn Stage>) -> Self {
    Self {
      name,
      inner: Arc::new(Mutex::new(stage)),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn lock(&self) -> MutexGuard<'_, Box<dyn Stage>> {
    self.inner.lock()
  }

  pub fn generated_parameters(&self) -> ParameterMap {
    self.inner.lock().generated_parameters()
  }

  pub fn generated(&self, key: &str) -> Option<Value> {
    self
      .generated_parameters()
      .get(key)
      .filter(|value| !value.is_null())
      .cloned()
  }

  pub fn same_instance(&self, other: &StageHandle) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

/// Resolved inputs handed to a stage constructor.
#[derive(Debug)]
pub struct StageParameters {
  stage: &'static str,
  values: ParameterMap,
  dependencies: HashMap<&'static str, StageHandle>,
}

impl StageParameters {
  pub fn new(stage: &'static str) -> Self {
    Self {
      stage,
      values: ParameterMap::new(),
      dependencies: HashMap::new(),
    }
  }

  pub fn with_value(mut self, field: &'static str, value: Value) -> Self {
    self.values.insert(field.to_string(), value);
    self
  }

  pub fn with_dependency(mut self, field: &'static str, handle: StageHandle) -> Self {
    self.dependencies.insert(field, handle);
    self
  }

  pub fn stage(&self) -> &'static str {
    self.stage
  }

  pub fn values(&self) -> &ParameterMap {
    &self.values
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.values.get(field).filter(|value| !value.is_null())
  }

  pub fn value<T: DeserializeOwned>(&self, field: &str) -> Result<T, StageError> {
    match self.optional(field)? {
      Some(value) => Ok(value),
      None => Err(StageError::MissingParameter {
        stage: self.stage.to_string(),
        field: field.to_string(),
      }),
    }
  }

  pub fn optional<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, StageError> {
    let Some(value) = self.get(field) else {
      return Ok(None);
    };
    serde_json::from_value(value.clone())
      .map(Some)
      .map_err(|source| StageError::InvalidParameter {
        stage: self.stage.to_string(),
        field: field.to_string(),
        source,
      })
  }

  pub fn dependency(&self, field: &str) -> Result<StageHandle, StageError> {
    self
      .dependencies
      .get(field)
      .cloned()
      .ok_or_else(|| StageError::MissingDependency {
        stage: self.stage.to_string(),
        dependency: field.to_string(),
      })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct Inert;

  impl Stage for Inert {
    fn command_sequence(&mut self, _start: bool) -> CommandSequence {
      Box::new(std::iter::empty())
    }
  }

  fn build(_: StageParameters) -> Result<Box<dyn Stage>, StageError> {
    Ok(Box::new(Inert))
  }

  fn source() -> StageDescriptor {
    StageDescriptor::new("source", build).field(FieldSpec::required("path"))
  }

  fn decoder() -> StageDescriptor {
    StageDescriptor::new("decoder", build)
      .field(FieldSpec::dependency("source", source))
      .field(FieldSpec::optional("threads", 2))
  }

  fn sink() -> StageDescriptor {
    StageDescriptor::new("sink", build)
      .field(FieldSpec::dependency("decoder", decoder))
      .field(FieldSpec::derived("link", source, "process_id"))
  }

  #[test]
  fn test_dependent_stages() {
    let direct: Vec<&str> = sink().dependent_stages(false).iter().map(|d| d.name).collect();
    assert_eq!(direct, vec!["decoder", "source"]);

    let all: Vec<&str> = decoder().dependent_stages(true).iter().map(|d| d.name).collect();
    assert_eq!(all, vec!["source"]);
    assert!(source().dependent_stages(true).is_empty());
  }

  #[test]
  fn test_parameter_kinds() {
    assert_eq!(source().defined_parameters(ParameterKind::Required), vec!["path"]);
    assert_eq!(decoder().defined_parameters(ParameterKind::Optional), vec!["threads"]);
    assert!(decoder().defined_parameters(ParameterKind::Required).is_empty());

    let derived = sink().derived_parameters();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].0, "link");
    assert_eq!((derived[0].1)().name, "source");
    assert_eq!(derived[0].2, "process_id");
  }

  #[test]
  fn test_stage_parameters_accessors() {
    let params = StageParameters::new("decoder")
      .with_value("threads", json!(4))
      .with_value("label", Value::Null);

    assert_eq!(params.value::<u32>("threads").unwrap(), 4);
    assert!(params.optional::<String>("label").unwrap().is_none());
    assert!(matches!(
      params.value::<String>("label"),
      Err(StageError::MissingParameter { .. })
    ));
    assert!(matches!(
      params.value::<String>("threads"),
      Err(StageError::InvalidParameter { .. })
    ));
    assert!(matches!(
      params.dependency("source"),
      Err(StageError::MissingDependency { .. })
    ));
  }
}
