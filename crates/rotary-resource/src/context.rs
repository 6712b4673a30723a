use std::any::{Any, TypeId};
use std::collections::HashMap;

use rotary_messaging::MessageBus;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{HandlerCatalog, Message, ProcessId, ResourceError, ResourceId, ResourceState, State, Task};

/// Lifecycle states of every resource a worker knows, one table per kind.
///
/// Resources without an entry are in [`State::Created`].
#[derive(Debug, Default)]
pub struct ResourceRegistry {
  tables: HashMap<String, HashMap<ResourceId, ResourceState>>,
}

impl ResourceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self, kind: &str, id: &ResourceId) -> State {
    self
      .tables
      .get(kind)
      .and_then(|table| table.get(id))
      .map(ResourceState::current)
      .unwrap_or(State::Created)
  }

  pub fn contains(&self, kind: &str, id: &ResourceId) -> bool {
    self
      .tables
      .get(kind)
      .is_some_and(|table| table.contains_key(id))
  }

  pub fn entry(&mut self, kind: &str, id: &ResourceId) -> &mut ResourceState {
    self
      .tables
      .entry(kind.to_string())
      .or_default()
      .entry(id.clone())
      .or_default()
  }

  pub fn evict(&mut self, kind: &str, id: &ResourceId) -> Option<ResourceState> {
    let table = self.tables.get_mut(kind)?;
    let removed = table.remove(id);
    if table.is_empty() {
      self.tables.remove(kind);
    }
    removed
  }

  pub fn len(&self, kind: &str) -> usize {
    self.tables.get(kind).map_or(0, HashMap::len)
  }

  pub fn is_empty(&self) -> bool {
    self.tables.is_empty()
  }
}

type Slot = HashMap<TypeId, Box<dyn Any + Send>>;

/// Per-resource storage owned by lifecycle handlers.
#[derive(Default)]
pub struct Extensions {
  slots: HashMap<(String, ResourceId), Slot>,
}

impl Extensions {
  fn slot(&mut self, kind: &str, id: &ResourceId) -> &mut Slot {
    self.slots.entry((kind.to_string(), id.clone())).or_default()
  }

  fn evict(&mut self, kind: &str, id: &ResourceId) {
    self.slots.remove(&(kind.to_string(), id.clone()));
  }

  fn has_resource(&self, kind: &str, id: &ResourceId) -> bool {
    self
      .slots
      .get(&(kind.to_string(), id.clone()))
      .is_some_and(|slot| !slot.is_empty())
  }
}

/// What a lifecycle handler sees while running one task.
pub struct TaskContext<'a> {
  task: &'a Task,
  state: State,
  slot: &'a mut Slot,
  bus: &'a MessageBus<Message>,
  process_id: &'a ProcessId,
}

impl<'a> TaskContext<'a> {
  pub fn task(&self) -> &Task {
    self.task
  }

  pub fn resource_id(&self) -> &ResourceId {
    &self.task.resource_id
  }

  pub fn params(&self) -> &Value {
    &self.task.params
  }

  /// Deserialize the task parameters.
  pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, ResourceError> {
    Ok(serde_json::from_value(self.task.params.clone())?)
  }

  /// State of the resource before this task.
  pub fn state(&self) -> State {
    self.state
  }

  pub fn bus(&self) -> &MessageBus<Message> {
    self.bus
  }

  pub fn process_id(&self) -> &ProcessId {
    self.process_id
  }

  pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
    self
      .slot
      .insert(TypeId::of::<T>(), Box::new(value))
      .and_then(|previous| previous.downcast::<T>().ok())
      .map(|previous| *previous)
  }

  pub fn get<T: Any + Send>(&self) -> Option<&T> {
    self
      .slot
      .get(&TypeId::of::<T>())
      .and_then(|value| value.downcast_ref::<T>())
  }

  pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
    self
      .slot
      .get_mut(&TypeId::of::<T>())
      .and_then(|value| value.downcast_mut::<T>())
  }

  pub fn take<T: Any + Send>(&mut self) -> Option<T> {
    self
      .slot
      .remove(&TypeId::of::<T>())
      .and_then(|value| value.downcast::<T>().ok())
      .map(|value| *value)
  }
}

/// Everything a worker process keeps between tasks.
pub struct ProcessContext {
  pub(crate) process_id: ProcessId,
  pub(crate) resources: ResourceRegistry,
  pub(crate) extensions: Extensions,
  pub(crate) catalog: HandlerCatalog,
  pub(crate) bus: MessageBus<Message>,
}

impl ProcessContext {
  pub fn new(process_id: ProcessId, catalog: HandlerCatalog, bus: MessageBus<Message>) -> Self {
    Self {
      process_id,
      resources: ResourceRegistry::new(),
      extensions: Extensions::default(),
      catalog,
      bus,
    }
  }

  pub fn process_id(&self) -> &ProcessId {
    &self.process_id
  }

  pub fn resources(&self) -> &ResourceRegistry {
    &self.resources
  }

  pub fn bus(&self) -> &MessageBus<Message> {
    &self.bus
  }

  /// Whether any handler storage is held for the resource.
  pub fn has_extensions(&self, kind: &str, id: &ResourceId) -> bool {
    self.extensions.has_resource(kind, id)
  }

  pub(crate) fn task_context<'a>(
    task: &'a Task,
    state: State,
    extensions: &'a mut Extensions,
    bus: &'a MessageBus<Message>,
    process_id: &'a ProcessId,
  ) -> TaskContext<'a> {
    TaskContext {
      task,
      state,
      slot: extensions.slot(&task.kind, &task.resource_id),
      bus,
      process_id,
    }
  }

  pub(crate) fn evict(&mut self, kind: &str, id: &ResourceId) {
    self.resources.evict(kind, id);
    self.extensions.evict(kind, id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Transition;

  #[test]
  fn test_registry_defaults_to_created() {
    let mut registry = ResourceRegistry::new();
    let id = ResourceId::new("cam");
    assert_eq!(registry.state("receiver", &id), State::Created);

    registry.entry("receiver", &id).send(Transition::Allocate).unwrap();
    assert_eq!(registry.state("receiver", &id), State::Allocated);
    assert_eq!(registry.state("filter", &id), State::Created);
    assert_eq!(registry.len("receiver"), 1);
  }

  #[test]
  fn test_evict_drops_empty_tables() {
    let mut registry = ResourceRegistry::new();
    let id = ResourceId::new("cam");
    registry.entry("receiver", &id);
    assert!(registry.evict("receiver", &id).is_some());
    assert!(registry.is_empty());
    assert!(registry.evict("receiver", &id).is_none());
  }
}
