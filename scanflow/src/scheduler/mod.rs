//! Timezone-aware daily scheduling.
//!
//! Jobs fire `RunRequested` events onto the bus at a configured local time
//! of day. Manual triggers publish the same event immediately.

mod job;
mod service;

pub use job::{JobPhase, JobStatus, ScheduledJob};
pub use service::{Scheduler, SchedulerStatus, TriggerOutcome};
