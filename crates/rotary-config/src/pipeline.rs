use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid pipeline definition: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid pipeline definition: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  pub name: String,
  /// Stage the run should reach.
  pub target: String,
  /// Parameters visible to every stage.
  #[serde(default)]
  pub parameters: Map<String, Value>,
  /// Parameters bound to one stage, keyed by stage name.
  #[serde(default)]
  pub stages: HashMap<String, Map<String, Value>>,
  #[serde(default = "default_start")]
  pub start: bool,
  /// Run the stop pass once the start pass has finished.
  #[serde(default)]
  pub stop_after: bool,
  #[serde(default)]
  pub scheduler: SchedulerDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerDef {
  /// Wait bound of the pipeline and orchestrator schedulers.
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Wait bound of each worker's scheduler.
  #[serde(default = "default_timeout_ms")]
  pub worker_timeout_ms: u64,
}

impl Default for SchedulerDef {
  fn default() -> Self {
    Self {
      timeout_ms: default_timeout_ms(),
      worker_timeout_ms: default_timeout_ms(),
    }
  }
}

impl SchedulerDef {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn worker_timeout(&self) -> Duration {
    Duration::from_millis(self.worker_timeout_ms)
  }
}

fn default_start() -> bool {
  true
}

fn default_timeout_ms() -> u64 {
  100
}

impl PipelineDef {
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let def: PipelineDef = serde_json::from_str(json)?;
    def.validate()?;
    Ok(def)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&json)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.target.trim().is_empty() {
      return Err(ConfigError::Invalid("target stage is empty".into()));
    }
    if self.scheduler.timeout_ms == 0 || self.scheduler.worker_timeout_ms == 0 {
      return Err(ConfigError::Invalid("scheduler timeouts must be positive".into()));
    }
    Ok(())
  }
}
