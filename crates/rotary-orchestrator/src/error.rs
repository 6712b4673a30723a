use rotary_messaging::MessagingError;
use rotary_resource::ProcessId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("no worker process {0}")]
  UnknownProcess(ProcessId),

  #[error("cannot route message: {0}")]
  Unroutable(String),

  #[error("no process factory for resource kind: {0}")]
  UnknownKind(String),

  #[error("failed to spawn worker thread: {0}")]
  Spawn(#[from] std::io::Error),

  #[error("worker {0} panicked")]
  WorkerPanicked(ProcessId),

  #[error("messaging error: {0}")]
  Messaging(#[from] MessagingError),
}
