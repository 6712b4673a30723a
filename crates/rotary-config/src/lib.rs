//! Rotary Config
//!
//! Serializable pipeline definitions. A definition names the stage to
//! reach, the parameters handed to the stage builder and the timeouts of
//! the schedulers that carry the run.

mod pipeline;

pub use pipeline::{ConfigError, PipelineDef, SchedulerDef};
