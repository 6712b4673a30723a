use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rotary_catalog::{PreviewStage, ReceiverStage, process_factory};
use rotary_channel::pipe;
use rotary_messaging::{Envelope, MessageBus, MessageThreadRegistry, MessagingScheduler};
use rotary_orchestrator::{ProcessOrchestrator, TASK_TOPIC};
use rotary_resource::{Message, ProcessShutdownSequence, Transition};
use rotary_stage::{LinearBuilderProgress, LinearStageBuilder, ParameterMap, TopicMessagingContext};
use serde_json::json;

const TICK: Option<Duration> = Some(Duration::from_millis(10));

struct Stack {
  bus: MessageBus<Message>,
  registry: MessageThreadRegistry<Message>,
  builder: LinearStageBuilder,
  orchestrator: ProcessOrchestrator,
  serving: Option<JoinHandle<()>>,
}

impl Stack {
  fn new() -> Self {
    let (caller_end, orchestrator_end) = pipe::<Envelope<Message>>();
    let bus = MessageBus::new(caller_end);
    let registry = MessageThreadRegistry::new();

    let front = MessageBus::new(orchestrator_end);
    let front_registry = MessageThreadRegistry::new();
    let mut scheduler = MessagingScheduler::new();
    let orchestrator = ProcessOrchestrator::new(process_factory(TICK), scheduler.handle(), TICK);
    orchestrator.attach(&front, &front_registry);
    let source_bus = front.clone();
    scheduler.add_source(
      front.channel(),
      move |envelope| source_bus.process_new_message(&front_registry, envelope).map(|_| ()),
      TICK,
    );
    let serving = thread::spawn(move || for _round in scheduler.serve_requests() {});

    let context = TopicMessagingContext::new(bus.clone(), TASK_TOPIC, registry.clone());
    let builder = LinearStageBuilder::new(Arc::new(context));

    Self {
      bus,
      registry,
      builder,
      orchestrator,
      serving: Some(serving),
    }
  }

  fn drive(&self, progress: &LinearBuilderProgress) {
    for _ in 0..500 {
      if progress.is_finished() || progress.failure().is_some() {
        return;
      }
      self
        .bus
        .recv_and_process_message(&self.registry, TICK)
        .unwrap();
    }
  }

  fn shutdown(&mut self) {
    self
      .bus
      .post(Some(TASK_TOPIC), Some(Message::Shutdown(ProcessShutdownSequence::requested())))
      .unwrap();
    if let Some(serving) = self.serving.take() {
      serving.join().unwrap();
    }
    self.orchestrator.shutdown_workers();
  }
}

fn params(value: serde_json::Value) -> ParameterMap {
  value.as_object().cloned().unwrap_or_default()
}

#[test]
fn test_preview_pipeline_start_and_stop() {
  let mut stack = Stack::new();
  stack.builder.add_parameters(params(json!({ "source": "cam0" })), None);
  stack
    .builder
    .add_parameters(params(json!({ "frames": 4 })), Some("preview"));

  let start = stack.builder.set_target::<PreviewStage>(true).unwrap();
  start.go().unwrap();
  stack.drive(&start);

  assert!(start.failure().is_none(), "{:?}", start.failure());
  assert!(start.is_finished());
  let map = start.parameter_map().unwrap();
  assert_eq!(map["receiver_source"], "cam0");
  assert_eq!(map["threshold"], 0.5);
  assert_eq!(map["last_frame"], 3);
  assert_eq!(stack.orchestrator.worker_ids().len(), 1);

  let sent: Vec<String> = start
    .processed_commands()
    .records()
    .into_iter()
    .map(|record| record.name)
    .collect();
  assert_eq!(
    sent,
    vec![
      "receiver.allocate",
      "receiver.start",
      "filter.allocate",
      "filter.start",
      "preview.allocate",
      "preview.start",
    ]
  );

  let stop = stack.builder.set_target::<PreviewStage>(false).unwrap();
  stop.go().unwrap();
  stack.drive(&stop);

  assert!(stop.failure().is_none(), "{:?}", stop.failure());
  assert!(stop.is_finished());
  let tags: Vec<_> = stop
    .processed_commands()
    .records()
    .into_iter()
    .map(|record| record.tag)
    .collect();
  assert_eq!(tags.len(), 6);
  assert!(tags.iter().all(|tag| *tag == Transition::Stop.tag() || *tag == Transition::Delete.tag()));

  stack.shutdown();
}

#[test]
fn test_invalid_filter_threshold_halts_pipeline() {
  let mut stack = Stack::new();
  stack.builder.add_parameters(params(json!({ "source": "cam1" })), None);
  stack
    .builder
    .add_parameters(params(json!({ "threshold": 3.0 })), Some("filter"));

  let start = stack.builder.set_target::<PreviewStage>(true).unwrap();
  start.go().unwrap();
  stack.drive(&start);

  assert!(!start.is_finished());
  assert!(start.failure().unwrap().contains("filter.allocate"));
  stack.shutdown();
}

#[test]
fn test_receiver_installs_task_log_patch() {
  let mut stack = Stack::new();
  stack
    .builder
    .add_parameters(params(json!({ "source": "cam2", "log_tasks": true })), Some("receiver"));

  let start = stack.builder.set_target::<ReceiverStage>(true).unwrap();
  start.go().unwrap();
  stack.drive(&start);

  assert!(start.failure().is_none(), "{:?}", start.failure());
  assert!(start.is_finished());
  let records = start.processed_commands().records();
  let names: Vec<&str> = records.iter().map(|record| record.name.as_str()).collect();
  assert_eq!(names, vec!["receiver.allocate", "receiver.log_tasks", "receiver.start"]);
  assert!(records.iter().all(|record| record.completed));
  assert_eq!(start.parameter_map().unwrap()["receiver_source"], "cam2");

  stack.shutdown();
}
