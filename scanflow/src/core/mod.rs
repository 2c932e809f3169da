//! Core domain model types for scanflow.
//!
//! This module contains the types shared by every component:
//! - Event priorities, kinds and typed payloads
//! - Stage and run status enums
//! - Stage outputs and per-stage results

mod event;
mod output;
mod priority;
mod status;

pub use event::{Event, EventKind, EventPayload, FallbackReason, RunFinished, TriggerSource};
pub use output::{StageErrorInfo, StageOutput, StageResult};
pub use priority::{EventPriority, RunKey};
pub use status::{RunStatus, StageStatus};
