use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rotary_channel::{ChannelError, PipeChannel};
use rotary_messaging::{
  Control, Envelope, MESSENGER_FALLBACK_TIMEOUT, MessageBus, MessageThreadRegistry, MessagingError,
  MessagingScheduler, SharedControl,
};
use rotary_resource::{HandlerCatalog, Message, ProcessContext, ProcessId, ProcessShutdownSequence, Task};
use tracing::{debug, info, instrument, warn};

use crate::OrchestratorError;

pub type WorkerThread = JoinHandle<Result<ProcessShutdownSequence, OrchestratorError>>;

/// A worker serving lifecycle tasks for the resources of one process id.
///
/// The first message it receives opens the setup exchange; the shutdown
/// notice is sent back along it when the loop ends. A message without topic
/// and payload stops the loop, as does a `Shutdown` payload, whether it
/// opens a new exchange or follows up on an open one.
pub struct TaskProcess {
  process_id: ProcessId,
  catalog: HandlerCatalog,
  timeout: Option<Duration>,
}

impl TaskProcess {
  pub fn new(process_id: ProcessId, catalog: HandlerCatalog) -> Self {
    Self {
      process_id,
      catalog,
      timeout: Some(MESSENGER_FALLBACK_TIMEOUT),
    }
  }

  /// Bound on each wait for messages; `None` waits indefinitely.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn process_id(&self) -> &ProcessId {
    &self.process_id
  }

  pub fn spawn(self, channel: PipeChannel<Envelope<Message>>) -> Result<WorkerThread, OrchestratorError> {
    let name = format!("rotary-worker-{}", self.process_id);
    Ok(thread::Builder::new().name(name).spawn(move || self.run(channel))?)
  }

  /// Serve `channel` until stopped. Returns the shutdown notice that was
  /// sent to the setup exchange.
  #[instrument(name = "worker", skip(self, channel), fields(process_id = %self.process_id))]
  pub fn run(self, channel: PipeChannel<Envelope<Message>>) -> Result<ProcessShutdownSequence, OrchestratorError> {
    let bus = MessageBus::new(channel);
    let registry = MessageThreadRegistry::new();
    let mut scheduler = MessagingScheduler::new();
    let setup: Arc<Mutex<Option<SharedControl<Message>>>> = Arc::new(Mutex::new(None));

    let admin_setup = Arc::clone(&setup);
    let admin = scheduler.handle();
    bus.add_listener(None, move |control: &mut Control<Message>| {
      let mut setup = admin_setup.lock();
      if setup.is_none() {
        *setup = control.handle().ok();
      }
      let stop = match control.reply() {
        None => control.topic().is_none(),
        Some(Message::Shutdown(_)) => true,
        Some(_) => false,
      };
      if stop {
        info!("stop requested");
        admin.dispose();
      }
      None
    });

    let mut context = ProcessContext::new(self.process_id.clone(), self.catalog, bus.clone());
    let runner = scheduler.handle();
    bus.add_listener(None, move |control: &mut Control<Message>| {
      if let Some(Message::Shutdown(_)) = control.reply() {
        // a stop sent along an open task exchange
        control.reply_to_message = false;
        control.keep_control = false;
        runner.dispose();
        return None;
      }
      context.handle_message(control)
    });

    let source_bus = bus.clone();
    let source_registry = registry.clone();
    scheduler.add_source(
      bus.channel(),
      move |envelope| source_bus.process_new_message(&source_registry, envelope).map(|_| ()),
      self.timeout,
    );

    info!("worker started");
    let mut clean_shutdown = true;
    for round in scheduler.serve_requests() {
      match round {
        Ok(()) => {}
        Err(MessagingError::Channel(ChannelError::Disconnected)) => {
          warn!("worker channel disconnected");
          clean_shutdown = false;
          break;
        }
        Err(e) => warn!(error = %e, "message dropped"),
      }
    }

    let notice = ProcessShutdownSequence {
      process_id: Some(self.process_id.clone()),
      expected: scheduler.is_disposed(),
      clean_shutdown,
    };

    let setup = setup.lock().take();
    match setup {
      Some(control) => {
        let mut control = control.lock();
        if let Err(e) = bus.deferred_reply(&mut control, Some(Message::Shutdown(notice.clone()))) {
          debug!(error = %e, "shutdown notice not delivered");
        }
      }
      None => debug!("no setup exchange to notify"),
    }

    info!(clean_shutdown, "worker stopped");
    Ok(notice)
  }
}

/// Creates the worker for a bootstrap task.
pub trait ProcessFactory: Send {
  fn create_process(&mut self, task: &Task) -> Result<TaskProcess, OrchestratorError>;
}

impl<F> ProcessFactory for F
where
  F: FnMut(&Task) -> Result<TaskProcess, OrchestratorError> + Send,
{
  fn create_process(&mut self, task: &Task) -> Result<TaskProcess, OrchestratorError> {
    self(task)
  }
}

type CatalogBuilder = Box<dyn Fn() -> HandlerCatalog + Send>;

/// Builds workers whose handler catalog is chosen by the bootstrap task's
/// resource kind.
pub struct CatalogProcessFactory {
  builders: HashMap<String, CatalogBuilder>,
  worker_timeout: Option<Duration>,
}

impl Default for CatalogProcessFactory {
  fn default() -> Self {
    Self::new()
  }
}

impl CatalogProcessFactory {
  pub fn new() -> Self {
    Self {
      builders: HashMap::new(),
      worker_timeout: Some(MESSENGER_FALLBACK_TIMEOUT),
    }
  }

  pub fn register(mut self, kind: impl Into<String>, catalog: impl Fn() -> HandlerCatalog + Send + 'static) -> Self {
    self.builders.insert(kind.into(), Box::new(catalog));
    self
  }

  pub fn with_worker_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.worker_timeout = timeout;
    self
  }
}

impl ProcessFactory for CatalogProcessFactory {
  fn create_process(&mut self, task: &Task) -> Result<TaskProcess, OrchestratorError> {
    let builder = self
      .builders
      .get(&task.kind)
      .ok_or_else(|| OrchestratorError::UnknownKind(task.kind.clone()))?;
    Ok(TaskProcess::new(task.process_id.clone(), builder()).with_timeout(self.worker_timeout))
  }
}
