use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rotary_channel::pipe;
use rotary_messaging::{
  Control, Envelope, ListenerId, MessageBus, MessageThreadRegistry, ReplyHandler, SchedulerHandle,
  SourceId,
};
use rotary_resource::{Message, ProcessId, ProcessShutdownSequence, Task, TaskResult};
use tracing::{debug, info, warn};

use crate::{OrchestratorError, ProcessFactory, WorkerThread};

/// Topic on which pipelines address workers.
pub const TASK_TOPIC: &str = "task";

struct Worker {
  bus: MessageBus<Message>,
  registry: MessageThreadRegistry<Message>,
  source: SourceId,
  thread: Option<WorkerThread>,
}

#[derive(Clone)]
struct WorkerLink {
  process_id: ProcessId,
  bus: MessageBus<Message>,
  registry: MessageThreadRegistry<Message>,
  /// The exchange spawned the worker and carries its shutdown notice.
  setup: bool,
}

struct Shared {
  factory: Mutex<Box<dyn ProcessFactory>>,
  workers: Mutex<HashMap<ProcessId, Worker>>,
  scheduler: SchedulerHandle,
  source_timeout: Option<Duration>,
}

/// Routes tasks from an upstream bus to worker threads, one per process
/// id, and proxies the replies of every exchange in both directions.
///
/// Worker channels are served by the scheduler behind `scheduler`, which is
/// disposed when the upstream sends a `Shutdown` message.
#[derive(Clone)]
pub struct ProcessOrchestrator {
  shared: Arc<Shared>,
}

impl ProcessOrchestrator {
  pub fn new(
    factory: impl ProcessFactory + 'static,
    scheduler: SchedulerHandle,
    source_timeout: Option<Duration>,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        factory: Mutex::new(Box::new(factory)),
        workers: Mutex::new(HashMap::new()),
        scheduler,
        source_timeout,
      }),
    }
  }

  /// Serve task messages arriving on `bus`, whose controls live in `registry`.
  pub fn attach(
    &self,
    bus: &MessageBus<Message>,
    registry: &MessageThreadRegistry<Message>,
  ) -> ListenerId {
    let orchestrator = self.clone();
    let upstream = bus.clone();
    let upstream_registry = registry.clone();
    bus.add_listener(Some(TASK_TOPIC), move |control: &mut Control<Message>| {
      orchestrator.recv_new_task_message(&upstream, &upstream_registry, control)
    })
  }

  pub fn worker_ids(&self) -> Vec<ProcessId> {
    let mut ids: Vec<ProcessId> = self.shared.workers.lock().keys().cloned().collect();
    ids.sort();
    ids
  }

  pub fn has_worker(&self, process_id: &ProcessId) -> bool {
    self.shared.workers.lock().contains_key(process_id)
  }

  /// Stop every worker and wait for its thread.
  pub fn shutdown_workers(&self) -> Vec<(ProcessId, Result<ProcessShutdownSequence, OrchestratorError>)> {
    let workers: Vec<(ProcessId, Worker)> = self.shared.workers.lock().drain().collect();
    let mut results = Vec::with_capacity(workers.len());
    for (process_id, mut worker) in workers {
      if let Err(e) = worker.bus.post(None, None) {
        debug!(process_id = %process_id, error = %e, "worker already gone");
      }
      self.shared.scheduler.remove_source(worker.source);
      let result = join(&process_id, worker.thread.take());
      info!(process_id = %process_id, "worker shut down");
      results.push((process_id, result));
    }
    results
  }

  fn recv_new_task_message(
    &self,
    upstream: &MessageBus<Message>,
    upstream_registry: &MessageThreadRegistry<Message>,
    source: &mut Control<Message>,
  ) -> Option<Message> {
    let message = match source.reply() {
      Some(Message::Shutdown(_)) => {
        info!("shutdown requested by upstream");
        self.shared.scheduler.dispose();
        return None;
      }
      Some(message) => message.clone(),
      None => return None,
    };

    let proxied = self
      .worker_for(&message)
      .and_then(|worker| self.proxy(upstream, upstream_registry, source, worker, message));
    match proxied {
      Ok(()) => None,
      Err(e) => {
        warn!(error = %e, "message not delivered");
        source.reply_to_message = true;
        source.keep_control = false;
        Some(Message::Result(TaskResult::failed(e.to_string())))
      }
    }
  }

  fn worker_for(&self, message: &Message) -> Result<WorkerLink, OrchestratorError> {
    let process_id = message
      .target_process()
      .ok_or_else(|| OrchestratorError::Unroutable("payload is not addressed to a process".into()))?;

    if let Some(worker) = self.shared.workers.lock().get(process_id) {
      return Ok(WorkerLink {
        process_id: process_id.clone(),
        bus: worker.bus.clone(),
        registry: worker.registry.clone(),
        setup: false,
      });
    }

    match message {
      Message::Task(task) if task.bootstrap => self.spawn_worker(task),
      _ => Err(OrchestratorError::UnknownProcess(process_id.clone())),
    }
  }

  fn spawn_worker(&self, task: &Task) -> Result<WorkerLink, OrchestratorError> {
    let process = self.shared.factory.lock().create_process(task)?;
    let process_id = task.process_id.clone();

    let (front, back) = pipe::<Envelope<Message>>();
    let bus = MessageBus::new(front);
    let registry = MessageThreadRegistry::new();
    let thread = process.spawn(back)?;

    let source_bus = bus.clone();
    let source_registry = registry.clone();
    let source = self.shared.scheduler.add_source(
      bus.channel(),
      move |envelope| source_bus.process_new_message(&source_registry, envelope).map(|_| ()),
      self.shared.source_timeout,
    );

    self.shared.workers.lock().insert(
      process_id.clone(),
      Worker {
        bus: bus.clone(),
        registry: registry.clone(),
        source,
        thread: Some(thread),
      },
    );
    info!(process_id = %process_id, kind = %task.kind, "worker spawned");

    Ok(WorkerLink {
      process_id,
      bus,
      registry,
      setup: true,
    })
  }

  /// Forward `message` to the worker and bind both ends of the exchange:
  /// worker replies go upstream, upstream follow-ups go to the worker.
  fn proxy(
    &self,
    upstream: &MessageBus<Message>,
    upstream_registry: &MessageThreadRegistry<Message>,
    source: &mut Control<Message>,
    worker: WorkerLink,
    message: Message,
  ) -> Result<(), OrchestratorError> {
    let source_handle: Weak<Mutex<Control<Message>>> = Arc::downgrade(&source.handle()?);

    let reply_to_source = {
      let orchestrator = self.clone();
      let upstream = upstream.clone();
      let upstream_registry = upstream_registry.clone();
      let process_id = worker.process_id.clone();
      let setup = worker.setup;
      Box::new(move |reply: &mut Control<Message>| {
        let payload = reply.reply().cloned();
        let shutdown = matches!(payload, Some(Message::Shutdown(_)));
        let finished = shutdown || (!setup && matches!(payload, Some(Message::Result(_))));
        reply.keep_control = !finished;
        if shutdown {
          orchestrator.retire(&process_id);
        }

        let Some(source) = source_handle.upgrade() else {
          debug!(process_id = %process_id, "upstream exchange already released");
          return None;
        };
        let mut source = source.lock();
        if shutdown {
          source.reply_to_message = false;
        }
        if finished {
          upstream_registry.remove(source.id());
        }
        if let Err(e) = upstream.deferred_reply(&mut source, payload) {
          warn!(process_id = %process_id, error = %e, "reply not forwarded upstream");
        }
        None
      }) as ReplyHandler<Message>
    };

    let downstream = worker
      .bus
      .request(Some(TASK_TOPIC), Some(message), reply_to_source)?;
    let downstream_handle: Weak<Mutex<Control<Message>>> = Arc::downgrade(&downstream);
    worker.registry.append(downstream);

    let worker_bus = worker.bus.clone();
    let process_id = worker.process_id;
    source.keep_control = true;
    source.set_handler(Box::new(move |source: &mut Control<Message>| {
      let Some(downstream) = downstream_handle.upgrade() else {
        warn!(process_id = %process_id, "worker exchange already released");
        source.keep_control = false;
        return None;
      };
      source.keep_control = true;
      let payload = source.reply().cloned();
      if let Err(e) = worker_bus.deferred_reply(&mut downstream.lock(), payload) {
        warn!(process_id = %process_id, error = %e, "follow-up not forwarded to worker");
      }
      None
    }));
    Ok(())
  }

  /// Drop a worker that announced its shutdown.
  fn retire(&self, process_id: &ProcessId) {
    let Some(mut worker) = self.shared.workers.lock().remove(process_id) else {
      return;
    };
    self.shared.scheduler.remove_source(worker.source);
    match join(process_id, worker.thread.take()) {
      Ok(notice) => info!(process_id = %process_id, clean = notice.clean_shutdown, "worker exited"),
      Err(e) => warn!(process_id = %process_id, error = %e, "worker failed"),
    }
  }
}

fn join(
  process_id: &ProcessId,
  thread: Option<WorkerThread>,
) -> Result<ProcessShutdownSequence, OrchestratorError> {
  match thread {
    Some(thread) => thread
      .join()
      .map_err(|_| OrchestratorError::WorkerPanicked(process_id.clone()))?,
    None => Ok(ProcessShutdownSequence {
      process_id: Some(process_id.clone()),
      expected: true,
      clean_shutdown: true,
    }),
  }
}
