use std::collections::HashMap;

use rotary_messaging::MessagePatch;
use serde_json::Value;

use crate::{Message, Outcome, ResourceError, TaskContext};

/// Lifecycle hooks of one resource kind.
///
/// Each hook runs for the matching transition; the transition is committed
/// only when the hook reports success.
pub trait ResourceHandler: Send {
  fn kind(&self) -> &str;

  fn allocate(&mut self, _cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    Ok(Outcome::Done(true))
  }

  fn start(&mut self, _cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    Ok(Outcome::Done(true))
  }

  fn stop(&mut self, _cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    Ok(Outcome::Done(true))
  }

  fn delete(&mut self, _cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    Ok(Outcome::Done(true))
  }
}

pub type BoxedPatch = Box<dyn MessagePatch<Message>>;

type PatchFactory = Box<dyn Fn(&Value) -> Result<BoxedPatch, ResourceError> + Send>;

/// The resource kinds and patches a worker can serve.
#[derive(Default)]
pub struct HandlerCatalog {
  handlers: HashMap<String, Box<dyn ResourceHandler>>,
  patches: HashMap<String, PatchFactory>,
}

impl HandlerCatalog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_handler(mut self, handler: impl ResourceHandler + 'static) -> Self {
    self.register(handler);
    self
  }

  pub fn register(&mut self, handler: impl ResourceHandler + 'static) {
    self
      .handlers
      .insert(handler.kind().to_string(), Box::new(handler));
  }

  /// Register a patch that workers can be asked to install by name.
  pub fn register_patch(
    &mut self,
    name: impl Into<String>,
    factory: impl Fn(&Value) -> Result<BoxedPatch, ResourceError> + Send + 'static,
  ) {
    self.patches.insert(name.into(), Box::new(factory));
  }

  pub fn handler_mut(&mut self, kind: &str) -> Option<&mut (dyn ResourceHandler + 'static)> {
    self.handlers.get_mut(kind).map(|handler| handler.as_mut())
  }

  pub fn build_patch(&self, name: &str, params: &Value) -> Result<BoxedPatch, ResourceError> {
    let factory = self
      .patches
      .get(name)
      .ok_or_else(|| ResourceError::UnknownPatch(name.to_string()))?;
    factory(params)
  }

  pub fn kinds(&self) -> Vec<&str> {
    let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    kinds.sort_unstable();
    kinds
  }
}
