//! Pipeline run coordination.
//!
//! The coordinator consumes `RunRequested` events, enforces one live run per
//! run key, drives the configured stages in order and publishes a
//! lifecycle event for every stage plus one terminal event per run.

mod driver;
mod registry;
mod run;

pub use driver::{Coordinator, CoordinatorStatus};
pub use registry::{RunPhase, RunRegistry, RunSlot};
pub use run::PipelineRun;
