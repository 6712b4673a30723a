use std::thread;
use std::time::Duration;

use rotary_messaging::{Control, MessagePatcher};
use rotary_resource::{
  BoxedPatch, DelayedResult, DelayedResultSource, HandlerCatalog, Message, Outcome, ResourceError,
  ResourceHandler, TaskContext, TaskResult,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub const RECEIVER: &str = "receiver";
pub const FILTER: &str = "filter";
pub const PREVIEW: &str = "preview";

/// Patch that logs every task a worker receives before running it.
pub const TASK_LOG_PATCH: &str = "task_log";

/// Handlers for every stock resource kind, plus the stock patches.
pub fn handler_catalog() -> HandlerCatalog {
  let mut catalog = HandlerCatalog::new()
    .with_handler(ReceiverHandler)
    .with_handler(FilterHandler)
    .with_handler(PreviewHandler);
  catalog.register_patch(TASK_LOG_PATCH, task_log_patch);
  catalog
}

fn task_log_patch(_params: &Value) -> Result<BoxedPatch, ResourceError> {
  Ok(Box::new(MessagePatcher::new(
    |control: &Control<Message>| matches!(control.reply(), Some(Message::Task(_))),
    |control, original| {
      if let Some(Message::Task(task)) = control.reply() {
        info!(kind = %task.kind, resource_id = %task.resource_id, command = %task.command, "task received");
      }
      original(control)
    },
  )))
}

#[derive(Debug, Deserialize)]
struct ReceiverParams {
  source: String,
}

struct Receiver {
  source: String,
  running: bool,
}

pub struct ReceiverHandler;

impl ResourceHandler for ReceiverHandler {
  fn kind(&self) -> &str {
    RECEIVER
  }

  fn allocate(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    let params: ReceiverParams = cx.parse_params()?;
    debug!(source = %params.source, "receiver allocated");
    cx.insert(Receiver {
      source: params.source,
      running: false,
    });
    Ok(Outcome::Done(true))
  }

  fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    let receiver = cx
      .get_mut::<Receiver>()
      .ok_or_else(|| ResourceError::handler("receiver was not allocated"))?;
    receiver.running = true;
    Ok(TaskResult::ok(true).with_data(json!({ "source": receiver.source })).into())
  }

  fn stop(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    match cx.get_mut::<Receiver>() {
      Some(receiver) if receiver.running => {
        receiver.running = false;
        Ok(Outcome::Done(true))
      }
      _ => Ok(Outcome::NoOp),
    }
  }

  fn delete(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    cx.take::<Receiver>();
    Ok(Outcome::Done(true))
  }
}

#[derive(Debug, Deserialize)]
struct FilterParams {
  threshold: f64,
}

pub struct FilterHandler;

impl ResourceHandler for FilterHandler {
  fn kind(&self) -> &str {
    FILTER
  }

  fn allocate(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    let params: FilterParams = cx.parse_params()?;
    if !(0.0..=1.0).contains(&params.threshold) {
      return Ok(TaskResult::failed(format!("threshold out of range: {}", params.threshold)).into());
    }
    cx.insert(params.threshold);
    Ok(Outcome::Done(true))
  }
}

#[derive(Debug, Deserialize)]
struct PreviewParams {
  #[serde(default = "default_frames")]
  frames: u32,
  #[serde(default)]
  interval_ms: u64,
}

fn default_frames() -> u32 {
  3
}

/// Streams a fixed number of synthetic frames per start.
pub struct PreviewHandler;

impl ResourceHandler for PreviewHandler {
  fn kind(&self) -> &str {
    PREVIEW
  }

  fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    let params: PreviewParams = cx.parse_params()?;
    let frames = params.frames.max(1);
    let interval = Duration::from_millis(params.interval_ms);

    let source = DelayedResultSource::new(DelayedResult::ok(true), move |control, bus| {
      let handle = control.handle()?;
      let bus = bus.clone();
      thread::Builder::new()
        .name("rotary-preview".into())
        .spawn(move || {
          for frame in 0..frames {
            if !interval.is_zero() {
              thread::sleep(interval);
            }
            let data = json!({ "frame": frame, "last": frame + 1 == frames });
            if let Err(e) = bus.deferred_reply(&mut handle.lock(), Some(Message::Data(data))) {
              warn!(error = %e, "preview stream interrupted");
              return;
            }
          }
        })
        .map_err(|e| ResourceError::handler(format!("failed to start preview stream: {e}")))?;
      Ok(Some(json!({ "frames": frames })))
    })
    .with_immediate_result();
    Ok(source.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_catalog_serves_stock_kinds() {
    let catalog = handler_catalog();
    let mut kinds = catalog.kinds();
    kinds.sort();
    assert_eq!(kinds, vec![FILTER, PREVIEW, RECEIVER]);
    assert!(catalog.build_patch(TASK_LOG_PATCH, &Value::Null).is_ok());
    assert!(catalog.build_patch("mute", &Value::Null).is_err());
  }
}
