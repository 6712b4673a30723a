use rotary_messaging::MessagingError;
use rotary_notify::NotifyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
  #[error("dependency cycle: stage {stage} depends on itself via {}", path.join(" -> "))]
  Cycle { stage: String, path: Vec<String> },

  #[error("stage {stage} is missing required parameter: {field}")]
  MissingParameter { stage: String, field: String },

  #[error("stage {stage} needs stage {dependency}, which has not been built")]
  MissingDependency { stage: String, dependency: String },

  #[error("stage {stage} has an invalid value for {field}: {source}")]
  InvalidParameter {
    stage: String,
    field: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to construct stage {stage}: {message}")]
  Construct { stage: String, message: String },

  #[error("messaging error: {0}")]
  Messaging(#[from] MessagingError),

  #[error("notification error: {0}")]
  Notify(#[from] NotifyError),
}

impl StageError {
  pub fn construct(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Construct {
      stage: stage.into(),
      message: message.into(),
    }
  }
}
