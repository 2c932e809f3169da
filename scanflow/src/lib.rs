//! # Scanflow
//!
//! Orchestration and resilience core for periodic data pipelines.
//!
//! Scanflow runs a fixed, ordered list of stages once per request, where
//! requests come from a timezone-aware daily scheduler or from a manual
//! trigger. It provides:
//!
//! - **Event bus**: priority tiers, bounded queues and failure-isolated
//!   handlers behind a single dispatch worker
//! - **Quota guard**: per-provider call budgets over fixed windows with
//!   provider selection for fallback
//! - **Scheduler**: DST-safe daily jobs fired by polling the wall clock
//! - **Coordinator**: single-flight runs with mandatory, optional and
//!   pipeline-aborting stages, per-stage timeouts and cancellation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scanflow::prelude::*;
//!
//! let config = SystemConfig::from_json_file("scanflow.json")?;
//! let fetch = FnStage::new("fetch", |ctx, provider| async move {
//!     let provider = provider.ok_or_else(|| StageError::failed("no provider"))?;
//!     let data = provider.invoke(serde_json::json!({ "run": ctx.run_key().as_str() })).await?;
//!     Ok(StageOutput::new(data))
//! })
//! .requires(["primary", "secondary"])
//! .abort_on_failure(true);
//!
//! let system = PipelineSystem::new(config, vec![Arc::new(fetch)])?;
//! system.register_provider(Arc::new(PrimaryApi::new()));
//! system.start();
//! system.trigger_now("daily-scan").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod app;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod quota;
pub mod scheduler;
pub mod stages;
pub mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::app::ApplicationContext;
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        BusConfig, CoordinatorConfig, JobConfig, ProviderQuotaConfig, SchedulerConfig, SystemConfig,
    };
    pub use crate::coordinator::{Coordinator, CoordinatorStatus};
    pub use crate::core::{
        Event, EventKind, EventPayload, EventPriority, RunKey, RunStatus, StageOutput, StageResult,
        StageStatus, TriggerSource,
    };
    pub use crate::errors::{ConfigError, ProviderError, ScanflowError, StageError};
    pub use crate::events::{EventBus, EventHandler, EventSink, KindFilter, LoggingEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::quota::{QuotaGuard, QuotaSnapshot};
    pub use crate::scheduler::{Scheduler, TriggerOutcome};
    pub use crate::stages::{FnStage, Provider, ProviderHandle, Stage, StageContext};
    pub use crate::system::{PipelineSystem, SystemShutdownReport, SystemStatus};
    pub use crate::utils::{Clock, SystemClock};
    pub use std::sync::Arc;
}
