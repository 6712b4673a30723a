//! Stage pipelines.
//!
//! A stage type describes its fields statically: plain parameters,
//! dependencies on other stage types and values derived from another
//! stage's outputs. [`LinearStageBuilder`] orders a target stage and its
//! dependencies deepest first, builds each stage when the run reaches it and
//! sends the stage's commands one by one through a [`MessagingContext`].
//!
//! ```text
//!   set_target::<Filter>(true)
//!     order: [Receiver, Filter]
//!     Receiver.command_sequence  ->  allocate, start   (one at a time)
//!     Filter built with Receiver's outputs
//!     Filter.command_sequence    ->  allocate, start
//!     completion_channel  <- parameter map
//! ```

mod builder;
mod command;
mod context;
mod error;
mod progress;
mod stage;

pub use builder::{LinearStageBuilder, StageState};
pub use command::{
  Command, CommandProgress, PatchCommand, ReplyProgress, ResourceBound, StreamingCommand,
  TaskCommand,
};
pub use context::{ContextChannel, MessagingContext, TopicMessagingContext};
pub use error::StageError;
pub use progress::{BuiltCommandList, CommandRecord, LinearBuilderProgress};
pub use stage::{
  CommandSequence, FieldKind, FieldSpec, ParameterKind, ParameterMap, Stage, StageConstructor,
  StageDescriptor, StageHandle, StageParameters, StageRef, StageType,
};
