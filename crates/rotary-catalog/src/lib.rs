//! Stock resources and stages.
//!
//! Three resource kinds share one worker: a receiver that bootstraps the
//! worker process, a filter bound to it and a preview that streams frames
//! back to the pipeline. Each kind comes with a resource handler for the
//! worker side and a stage for the pipeline side.

mod handlers;
mod stages;

use std::time::Duration;

use rotary_orchestrator::CatalogProcessFactory;

pub use handlers::{
  FILTER, FilterHandler, PREVIEW, PreviewHandler, RECEIVER, ReceiverHandler, TASK_LOG_PATCH,
  handler_catalog,
};
pub use stages::{FilterStage, PreviewStage, ReceiverStage, stage_by_name};

/// A factory whose workers serve every stock kind.
pub fn process_factory(worker_timeout: Option<Duration>) -> CatalogProcessFactory {
  [RECEIVER, FILTER, PREVIEW]
    .into_iter()
    .fold(CatalogProcessFactory::new(), |factory, kind| {
      factory.register(kind, handler_catalog)
    })
    .with_worker_timeout(worker_timeout)
}
