//! Rotary Resource
//!
//! The payloads exchanged with worker processes and the machinery a worker
//! uses to run them.
//!
//! A [`Task`] names a resource (kind + id), a lifecycle command and the
//! worker process it belongs to. The worker looks up the
//! [`ResourceHandler`] for the kind, checks the command against the
//! resource's [`ResourceState`], runs the matching hook and normalizes its
//! [`Outcome`] into the reply [`Message`]:
//!
//! ```text
//! created ──allocate──▶ allocated ──start──▶ started
//!    │                     │  ▲                 │
//!    │                     │  └──────start──┐  stop
//!    │                   delete             │   ▼
//!    └──────delete──────▶ removed ◀─delete─ stopped
//! ```

mod context;
mod error;
mod handler;
mod message;
mod outcome;
mod state;
mod task;

pub use context::{ProcessContext, ResourceRegistry, TaskContext};
pub use error::ResourceError;
pub use handler::{BoxedPatch, HandlerCatalog, ResourceHandler};
pub use message::{
  DelayedResult, Message, PatchRequest, ProcessId, ProcessShutdownSequence, ResourceId, Status,
  Tag, Task, TaskResult,
};
pub use outcome::{DelayedCallback, DelayedResultSource, Outcome};
pub use state::{PROCESS_TAG, ResourceState, State, Transition, TransitionError};
pub use task::ControlTask;
