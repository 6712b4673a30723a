use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rotary_channel::pipe;
use rotary_messaging::{
  Control, Envelope, MessageBus, MessageThreadRegistry, MessagingScheduler, SharedControl,
};
use rotary_orchestrator::{OrchestratorError, ProcessOrchestrator, TASK_TOPIC, TaskProcess};
use rotary_resource::{
  DelayedResult, DelayedResultSource, HandlerCatalog, Message, Outcome, ProcessId,
  ProcessShutdownSequence, ResourceError, ResourceHandler, ResourceId, Task, TaskContext,
  Transition,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));
const TICK: Option<Duration> = Some(Duration::from_millis(10));

struct Probe;

impl ResourceHandler for Probe {
  fn kind(&self) -> &str {
    "probe"
  }
}

/// Keeps its allocate exchange open.
struct Streamer;

impl ResourceHandler for Streamer {
  fn kind(&self) -> &str {
    "streamer"
  }

  fn allocate(&mut self, _cx: &mut TaskContext<'_>) -> Result<Outcome, ResourceError> {
    Ok(Outcome::Delayed(DelayedResultSource::new(
      DelayedResult::ok(true),
      |_, _| Ok(None),
    )))
  }
}

fn catalog() -> HandlerCatalog {
  HandlerCatalog::new().with_handler(Probe).with_handler(Streamer)
}

struct Harness {
  caller: MessageBus<Message>,
  registry: MessageThreadRegistry<Message>,
  orchestrator: ProcessOrchestrator,
  created: Arc<AtomicUsize>,
  serving: Option<JoinHandle<()>>,
  replies: Arc<Mutex<Vec<Message>>>,
}

impl Harness {
  fn new() -> Self {
    let (caller_end, orchestrator_end) = pipe::<Envelope<Message>>();
    let caller = MessageBus::new(caller_end);
    let front = MessageBus::new(orchestrator_end);
    let front_registry = MessageThreadRegistry::new();

    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let mut scheduler = MessagingScheduler::new();
    let orchestrator = ProcessOrchestrator::new(
      move |task: &Task| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, OrchestratorError>(TaskProcess::new(task.process_id.clone(), catalog()).with_timeout(TICK))
      },
      scheduler.handle(),
      TICK,
    );
    orchestrator.attach(&front, &front_registry);

    let source_bus = front.clone();
    scheduler.add_source(
      front.channel(),
      move |envelope| source_bus.process_new_message(&front_registry, envelope).map(|_| ()),
      TICK,
    );
    let serving = thread::spawn(move || for _round in scheduler.serve_requests() {});

    Self {
      caller,
      registry: MessageThreadRegistry::new(),
      orchestrator,
      created,
      serving: Some(serving),
      replies: Arc::new(Mutex::new(Vec::new())),
    }
  }

  fn send(&self, task: Task, keep: bool) -> SharedControl<Message> {
    let sink = Arc::clone(&self.replies);
    let control = self
      .caller
      .request(
        Some(TASK_TOPIC),
        Some(Message::Task(task)),
        Box::new(move |control: &mut Control<Message>| {
          control.keep_control = keep;
          sink.lock().extend(control.reply().cloned());
          None
        }),
      )
      .unwrap();
    self.registry.append(control.clone());
    control
  }

  fn receive(&self) -> Message {
    self
      .caller
      .recv_and_process_message(&self.registry, WAIT)
      .unwrap()
      .expect("no reply before timeout");
    self.replies.lock().last().cloned().unwrap()
  }

  fn stop(&mut self) -> Vec<(ProcessId, Result<ProcessShutdownSequence, OrchestratorError>)> {
    self
      .caller
      .post(Some(TASK_TOPIC), Some(Message::Shutdown(ProcessShutdownSequence::requested())))
      .unwrap();
    if let Some(serving) = self.serving.take() {
      serving.join().unwrap();
    }
    self.orchestrator.shutdown_workers()
  }
}

#[test]
fn test_bound_tasks_reach_the_same_worker() {
  let mut harness = Harness::new();
  let allocate = Task::bootstrap("probe", Transition::Allocate, ResourceId::new("p0"));
  let process_id = allocate.process_id.clone();

  harness.send(allocate, false);
  assert!(harness.receive().is_ok_outcome());

  harness.send(
    Task::bound("probe", Transition::Start, process_id.clone(), ResourceId::new("p0")),
    false,
  );
  assert!(harness.receive().is_ok_outcome());

  // a second bootstrap for the same id reuses the worker
  let mut again = Task::bootstrap("probe", Transition::Allocate, ResourceId::new("p1"));
  again.process_id = process_id.clone();
  harness.send(again, false);
  assert!(harness.receive().is_ok_outcome());

  assert_eq!(harness.created.load(Ordering::SeqCst), 1);
  assert_eq!(harness.orchestrator.worker_ids(), vec![process_id.clone()]);

  let stopped = harness.stop();
  assert_eq!(stopped.len(), 1);
  let (id, notice) = &stopped[0];
  assert_eq!(id, &process_id);
  let notice = notice.as_ref().unwrap();
  assert!(notice.expected && notice.clean_shutdown);
}

#[test]
fn test_unknown_process_gets_failed_reply() {
  let mut harness = Harness::new();
  harness.send(
    Task::bound("probe", Transition::Start, ProcessId::new("ghost"), ResourceId::new("p0")),
    false,
  );

  match harness.receive() {
    Message::Result(result) => {
      assert!(!result.is_ok());
      assert!(result.data.as_str().unwrap_or_default().contains("ghost"));
    }
    other => panic!("expected a result, got {other:?}"),
  }
  assert_eq!(harness.created.load(Ordering::SeqCst), 0);
  assert!(harness.stop().is_empty());
}

#[test]
fn test_worker_shutdown_notice_reaches_caller() {
  let mut harness = Harness::new();
  let allocate = Task::bootstrap("streamer", Transition::Allocate, ResourceId::new("s0"));
  let process_id = allocate.process_id.clone();

  let exchange = harness.send(allocate, true);
  assert!(matches!(harness.receive(), Message::Delayed(_)));

  harness
    .caller
    .deferred_reply(
      &mut exchange.lock(),
      Some(Message::Shutdown(ProcessShutdownSequence::requested())),
    )
    .unwrap();

  match harness.receive() {
    Message::Shutdown(notice) => {
      assert_eq!(notice.process_id, Some(process_id.clone()));
      assert!(notice.expected);
      assert!(notice.clean_shutdown);
    }
    other => panic!("expected a shutdown notice, got {other:?}"),
  }
  assert!(!harness.orchestrator.has_worker(&process_id));
  assert!(harness.stop().is_empty());
}
