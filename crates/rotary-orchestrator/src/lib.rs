//! Worker processes and the orchestrator that feeds them.
//!
//! ```text
//!  pipeline bus --"task"--> ProcessOrchestrator --pipe--> TaskProcess (thread)
//!        ^                        |  proxies replies          |
//!        +------------------------+  <------------------------+
//! ```
//!
//! Each bootstrap task names a fresh process id; the orchestrator asks its
//! [`ProcessFactory`] for a worker exactly once per id and routes every later
//! task for that id to the same worker.

mod error;
mod orchestrator;
mod worker;

pub use error::OrchestratorError;
pub use orchestrator::{ProcessOrchestrator, TASK_TOPIC};
pub use worker::{CatalogProcessFactory, ProcessFactory, TaskProcess, WorkerThread};
