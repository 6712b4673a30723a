use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rotary_notify::UpdateChannel;
use rotary_resource::{ProcessId, Tag};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
  FieldKind, LinearBuilderProgress, MessagingContext, ParameterMap, StageDescriptor, StageError,
  StageHandle, StageParameters, StageType,
};

/// Lifecycle bookkeeping of one stage inside a builder.
#[derive(Clone)]
pub struct StageState {
  /// The stage has been built and started issuing commands.
  pub reached: bool,
  /// Its current command sequence has run out.
  pub exhausted: bool,
  pub latest_instance: Option<StageHandle>,
  /// Worker addressed by the stage's most recent resource-bound command.
  pub resource_id: Option<ProcessId>,
  /// Tags of the commands the stage sent, in order.
  pub command_notify: UpdateChannel<Tag>,
}

impl Default for StageState {
  fn default() -> Self {
    Self {
      reached: false,
      exhausted: false,
      latest_instance: None,
      resource_id: None,
      command_notify: UpdateChannel::new(),
    }
  }
}

#[derive(Default)]
struct BuilderState {
  global: ParameterMap,
  per_stage: HashMap<String, ParameterMap>,
  instances: HashMap<&'static str, StageHandle>,
  states: HashMap<&'static str, StageState>,
}

impl BuilderState {
  fn merged(&self, stage: &str) -> ParameterMap {
    let mut merged = self.global.clone();
    if let Some(own) = self.per_stage.get(stage) {
      merged.extend(own.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    merged
  }
}

fn present<'a>(map: &'a ParameterMap, key: &str) -> Option<&'a Value> {
  map.get(key).filter(|value| !value.is_null())
}

/// Builds stages in dependency order and drives them through one
/// messaging context.
///
/// Cloning yields another handle to the same builder.
#[derive(Clone)]
pub struct LinearStageBuilder {
  state: Arc<Mutex<BuilderState>>,
  context: Arc<dyn MessagingContext>,
}

impl LinearStageBuilder {
  pub fn new(context: Arc<dyn MessagingContext>) -> Self {
    Self {
      state: Arc::new(Mutex::new(BuilderState::default())),
      context,
    }
  }

  pub fn context(&self) -> &Arc<dyn MessagingContext> {
    &self.context
  }

  /// Merge `parameters` into the global map, or into the map of
  /// `bind_stage` when given. Later values replace earlier ones.
  pub fn add_parameters(&self, parameters: ParameterMap, bind_stage: Option<&str>) {
    let mut state = self.state.lock();
    let target = match bind_stage {
      Some(stage) => state.per_stage.entry(stage.to_string()).or_default(),
      None => &mut state.global,
    };
    target.extend(parameters);
  }

  pub fn parameters(&self, bind_stage: Option<&str>) -> ParameterMap {
    let state = self.state.lock();
    match bind_stage {
      Some(stage) => state.per_stage.get(stage).cloned().unwrap_or_default(),
      None => state.global.clone(),
    }
  }

  pub fn stage_state(&self, stage: &str) -> Option<StageState> {
    self.state.lock().states.get(stage).cloned()
  }

  pub fn instance(&self, stage: &str) -> Option<StageHandle> {
    self.state.lock().instances.get(stage).cloned()
  }

  /// Order `targets` and everything they depend on, deepest dependency
  /// first. Stages at equal depth keep their discovery order.
  pub fn generate_order(&self, targets: &[StageDescriptor]) -> Result<Vec<StageDescriptor>, StageError> {
    let mut levels: Vec<(StageDescriptor, usize)> = Vec::new();
    let mut path = Vec::new();
    dependency_lookup(targets, &mut path, &mut levels)?;

    // stable: equal levels keep discovery order
    levels.sort_by(|(_, a), (_, b)| b.cmp(a));
    Ok(levels.into_iter().map(|(descriptor, _)| descriptor).collect())
  }

  pub fn set_target<T: StageType>(&self, start: bool) -> Result<LinearBuilderProgress, StageError> {
    self.set_target_descriptor(T::descriptor(), start)
  }

  /// Plan a run reaching `target`. Ordering and required parameters are
  /// checked here; nothing is sent until [`LinearBuilderProgress::go`].
  #[instrument(name = "set_target", skip(self, target), fields(target = target.name))]
  pub fn set_target_descriptor(
    &self,
    target: StageDescriptor,
    start: bool,
  ) -> Result<LinearBuilderProgress, StageError> {
    let order = self.generate_order(std::slice::from_ref(&target))?;
    self.validate(&order)?;

    {
      let mut state = self.state.lock();
      for descriptor in &order {
        let entry = state.states.entry(descriptor.name).or_default();
        entry.exhausted = false;
      }
    }

    let names: Vec<&str> = order.iter().map(|descriptor| descriptor.name).collect();
    debug!(order = ?names, "stage order resolved");
    Ok(LinearBuilderProgress::new(self.clone(), target.name, order, start))
  }

  fn validate(&self, order: &[StageDescriptor]) -> Result<(), StageError> {
    let state = self.state.lock();
    for descriptor in order {
      if state.instances.contains_key(descriptor.name) {
        continue;
      }
      let merged = state.merged(descriptor.name);
      for field in &descriptor.fields {
        if matches!(field.kind, FieldKind::Required) && present(&merged, field.name).is_none() {
          return Err(StageError::MissingParameter {
            stage: descriptor.name.to_string(),
            field: field.name.to_string(),
          });
        }
      }
    }
    Ok(())
  }

  /// The stage's instance, built from the current parameters if needed.
  pub(crate) fn build_stage(&self, descriptor: &StageDescriptor) -> Result<StageHandle, StageError> {
    let parameters = {
      let state = self.state.lock();
      if let Some(handle) = state.instances.get(descriptor.name) {
        return Ok(handle.clone());
      }
      resolve_parameters(&state, descriptor)?
    };

    let stage = (descriptor.construct)(parameters)?;
    let handle = StageHandle::new(descriptor.name, stage);
    self
      .state
      .lock()
      .instances
      .insert(descriptor.name, handle.clone());
    debug!(stage = descriptor.name, "stage built");
    Ok(handle)
  }

  pub(crate) fn mark_reached(&self, stage: &'static str, handle: &StageHandle) {
    let mut state = self.state.lock();
    let entry = state.states.entry(stage).or_default();
    entry.reached = true;
    entry.exhausted = false;
    entry.latest_instance = Some(handle.clone());
  }

  pub(crate) fn mark_exhausted(&self, stage: &'static str) {
    self.state.lock().states.entry(stage).or_default().exhausted = true;
  }

  /// Record a sent command; returns the channel announcing its tag.
  pub(crate) fn note_command(
    &self,
    stage: &'static str,
    resource_id: Option<ProcessId>,
  ) -> UpdateChannel<Tag> {
    let mut state = self.state.lock();
    let entry = state.states.entry(stage).or_default();
    if resource_id.is_some() {
      entry.resource_id = resource_id;
    }
    entry.command_notify.clone()
  }
}

fn dependency_lookup(
  stages: &[StageDescriptor],
  path: &mut Vec<&'static str>,
  levels: &mut Vec<(StageDescriptor, usize)>,
) -> Result<(), StageError> {
  for descriptor in stages {
    if path.contains(&descriptor.name) {
      let mut cycle: Vec<String> = path.iter().map(|name| name.to_string()).collect();
      cycle.push(descriptor.name.to_string());
      return Err(StageError::Cycle {
        stage: descriptor.name.to_string(),
        path: cycle,
      });
    }

    let level = path.len() + 1;
    match levels.iter_mut().find(|(known, _)| known.name == descriptor.name) {
      Some((_, known)) => *known = (*known).max(level),
      None => levels.push((descriptor.clone(), level)),
    }

    path.push(descriptor.name);
    let dependencies = descriptor.dependent_stages(false);
    let result = dependency_lookup(&dependencies, path, levels);
    path.pop();
    result?;
  }
  Ok(())
}

/// Merge order: global, then the stage's own map, then dependency
/// instances, then derived values. A supplied value only fills a derived
/// field when the dependency chain yields nothing.
fn resolve_parameters(
  state: &BuilderState,
  descriptor: &StageDescriptor,
) -> Result<StageParameters, StageError> {
  let merged = state.merged(descriptor.name);
  let mut parameters = StageParameters::new(descriptor.name);

  for field in &descriptor.fields {
    match &field.kind {
      FieldKind::Required => {
        let value = present(&merged, field.name).ok_or_else(|| StageError::MissingParameter {
          stage: descriptor.name.to_string(),
          field: field.name.to_string(),
        })?;
        parameters = parameters.with_value(field.name, value.clone());
      }
      FieldKind::Optional(default) => {
        let value = present(&merged, field.name).unwrap_or(default);
        parameters = parameters.with_value(field.name, value.clone());
      }
      FieldKind::Dependency(stage) => {
        let dependency = stage();
        let handle = state
          .instances
          .get(dependency.name)
          .ok_or_else(|| StageError::MissingDependency {
            stage: descriptor.name.to_string(),
            dependency: dependency.name.to_string(),
          })?;
        parameters = parameters.with_dependency(field.name, handle.clone());
      }
      FieldKind::Derived { stage, output } => {
        let source = stage().name;
        let derived = state
          .instances
          .get(source)
          .and_then(|handle| handle.generated(output))
          .or_else(|| {
            state
              .per_stage
              .get(source)
              .and_then(|own| present(own, output))
              .cloned()
          })
          .or_else(|| present(&state.global, output).cloned());
        if let Some(value) = derived.or_else(|| present(&merged, field.name).cloned()) {
          parameters = parameters.with_value(field.name, value);
        }
      }
    }
  }
  Ok(parameters)
}
