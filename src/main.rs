use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rotary_catalog::{process_factory, stage_by_name};
use rotary_channel::pipe;
use rotary_config::PipelineDef;
use rotary_messaging::{Envelope, MessageBus, MessageThreadRegistry, MessagingScheduler};
use rotary_orchestrator::{ProcessOrchestrator, TASK_TOPIC};
use rotary_resource::{Message, ProcessShutdownSequence};
use rotary_stage::{
  LinearBuilderProgress, LinearStageBuilder, ParameterMap, StageDescriptor, TopicMessagingContext,
};

/// Rotary - staged resource pipelines over worker processes
#[derive(Parser)]
#[command(name = "rotary")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline until its target stage is reached
  Run {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Run { pipeline_file }) => run_pipeline(pipeline_file)?,
    None => {
      println!("rotary - use --help to see available commands");
    }
  }

  Ok(())
}

fn run_pipeline(pipeline_file: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_pipeline_async(pipeline_file).await })
}

/// Shared bookkeeping of the start pass and the optional stop pass.
#[derive(Clone)]
struct Run {
  builder: LinearStageBuilder,
  target: StageDescriptor,
  cancel: CancellationToken,
  outcome: Arc<Mutex<Option<Result<ParameterMap, String>>>>,
}

impl Run {
  fn finish(&self, map: ParameterMap) {
    self.outcome.lock().get_or_insert(Ok(map));
    self.cancel.cancel();
  }

  fn fail(&self, reason: String) {
    *self.outcome.lock() = Some(Err(reason));
    self.cancel.cancel();
  }

  fn watch(&self, progress: &LinearBuilderProgress, then_stop: bool) {
    let run = self.clone();
    progress.completion_channel().subscribe(move |update| {
      if !then_stop {
        run.finish(update.value.clone());
        return;
      }
      info!("start pass finished, running stop pass");
      *run.outcome.lock() = Some(Ok(update.value.clone()));
      match run.builder.set_target_descriptor(run.target.clone(), false) {
        Ok(stop) => {
          run.watch(&stop, false);
          if let Err(e) = stop.go() {
            run.fail(e.to_string());
          }
        }
        Err(e) => run.fail(e.to_string()),
      }
    });

    let run = self.clone();
    let observed = progress.clone();
    progress
      .processed_commands()
      .command_incomplete
      .subscribe(move |_| {
        if let Some(reason) = observed.failure() {
          run.fail(reason);
        }
      });
  }
}

fn serve(name: &str, scheduler: &mut MessagingScheduler) {
  for round in scheduler.serve_requests() {
    if let Err(e) = round {
      debug!(scheduler = name, error = %e, "message dropped");
    }
  }
  debug!(scheduler = name, "scheduler stopped");
}

async fn run_pipeline_async(pipeline_file: PathBuf) -> Result<()> {
  let def = PipelineDef::from_path(&pipeline_file)
    .with_context(|| format!("failed to load pipeline file: {}", pipeline_file.display()))?;
  let target = stage_by_name(&def.target).with_context(|| format!("unknown stage '{}'", def.target))?;
  info!(pipeline = %def.name, target_stage = %def.target, "pipeline loaded");

  let timeout = Some(def.scheduler.timeout());
  let (caller_end, orchestrator_end) = pipe::<Envelope<Message>>();

  // Orchestrator side
  let front = MessageBus::new(orchestrator_end);
  let front_registry = MessageThreadRegistry::new();
  let mut orchestrator_scheduler = MessagingScheduler::new();
  let orchestrator = ProcessOrchestrator::new(
    process_factory(Some(def.scheduler.worker_timeout())),
    orchestrator_scheduler.handle(),
    timeout,
  );
  orchestrator.attach(&front, &front_registry);
  let front_bus = front.clone();
  orchestrator_scheduler.add_source(
    front.channel(),
    move |envelope| front_bus.process_new_message(&front_registry, envelope).map(|_| ()),
    timeout,
  );
  let orchestrator_thread = thread::Builder::new()
    .name("rotary-orchestrator".into())
    .spawn(move || serve("orchestrator", &mut orchestrator_scheduler))
    .context("failed to start orchestrator thread")?;

  // Pipeline side
  let cancel = CancellationToken::new();
  let mut scheduler = MessagingScheduler::with_cancellation(cancel.clone());
  let bus = MessageBus::new(caller_end);
  let registry = MessageThreadRegistry::new();
  let source_bus = bus.clone();
  let source_registry = registry.clone();
  scheduler.add_source(
    bus.channel(),
    move |envelope| source_bus.process_new_message(&source_registry, envelope).map(|_| ()),
    timeout,
  );

  let context = TopicMessagingContext::new(bus.clone(), TASK_TOPIC, registry);
  let builder = LinearStageBuilder::new(Arc::new(context));
  builder.add_parameters(def.parameters.clone(), None);
  for (stage, parameters) in &def.stages {
    builder.add_parameters(parameters.clone(), Some(stage.as_str()));
  }

  let run = Run {
    builder: builder.clone(),
    target: target.clone(),
    cancel: cancel.clone(),
    outcome: Arc::new(Mutex::new(None)),
  };
  let progress = builder
    .set_target_descriptor(target, def.start)
    .context("failed to plan pipeline")?;
  run.watch(&progress, def.start && def.stop_after);
  progress.go().context("failed to start pipeline")?;

  let serving = tokio::task::spawn_blocking(move || serve("pipeline", &mut scheduler));
  tokio::select! {
    _ = tokio::signal::ctrl_c() => {
      warn!("interrupted");
      cancel.cancel();
    }
    _ = cancel.cancelled() => {}
  }
  serving.await.context("pipeline scheduler failed")?;

  bus
    .post(Some(TASK_TOPIC), Some(Message::Shutdown(ProcessShutdownSequence::requested())))
    .context("failed to stop orchestrator")?;
  orchestrator_thread
    .join()
    .map_err(|_| anyhow!("orchestrator thread panicked"))?;
  for (process_id, result) in orchestrator.shutdown_workers() {
    match result {
      Ok(notice) => info!(process_id = %process_id, clean = notice.clean_shutdown, "worker stopped"),
      Err(e) => warn!(process_id = %process_id, error = %e, "worker stopped abnormally"),
    }
  }

  let outcome = run.outcome.lock().take();
  match outcome {
    Some(Ok(map)) => {
      println!("{}", serde_json::to_string_pretty(&map)?);
      Ok(())
    }
    Some(Err(reason)) => bail!("pipeline failed: {reason}"),
    None => bail!("pipeline interrupted"),
  }
}
