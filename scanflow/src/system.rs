//! Wiring of bus, quota guard, scheduler and coordinator into one system.

use crate::app::ApplicationContext;
use crate::config::SystemConfig;
use crate::coordinator::{Coordinator, CoordinatorStatus};
use crate::errors::ScanflowError;
use crate::events::{BusMetricsSnapshot, LoggingEventSink, ShutdownReport};
use crate::quota::QuotaSnapshot;
use crate::scheduler::{Scheduler, SchedulerStatus, TriggerOutcome};
use crate::stages::{Provider, Stage};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Combined status of every component.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Bus counters and queue depths.
    pub bus: BusMetricsSnapshot,
    /// Per-provider quota usage.
    pub quotas: Vec<QuotaSnapshot>,
    /// Coordinator counters and active runs.
    pub coordinator: CoordinatorStatus,
    /// Scheduled jobs.
    pub scheduler: SchedulerStatus,
}

/// Outcome of [`PipelineSystem::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemShutdownReport {
    /// Runs that did not wind down within the grace period.
    pub aborted_runs: usize,
    /// What happened to queued events.
    pub bus: ShutdownReport,
}

/// A complete, startable pipeline system.
///
/// ```rust,ignore
/// let system = PipelineSystem::new(config, stages)?;
/// system.register_provider(Arc::new(MyProvider::new()));
/// system.start();
/// system.trigger_now("daily-scan").await?;
/// let report = system.shutdown(true).await;
/// ```
#[derive(Debug)]
pub struct PipelineSystem {
    context: ApplicationContext,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<Scheduler>,
    started: AtomicBool,
}

impl PipelineSystem {
    /// Validates `config` and builds a system on the system clock.
    pub fn new(config: SystemConfig, stages: Vec<Arc<dyn Stage>>) -> Result<Self, ScanflowError> {
        Self::with_context(ApplicationContext::new(config)?, stages)
    }

    /// Builds a system over an existing context.
    pub fn with_context(context: ApplicationContext, stages: Vec<Arc<dyn Stage>>) -> Result<Self, ScanflowError> {
        let scheduler = Scheduler::new(&context)?;
        let coordinator = Coordinator::new(&context, stages);
        Ok(Self {
            context,
            coordinator,
            scheduler,
            started: AtomicBool::new(false),
        })
    }

    /// Registers a provider implementation.
    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.context.providers.register(provider);
    }

    /// The shared handles.
    #[must_use]
    pub fn context(&self) -> &ApplicationContext {
        &self.context
    }

    /// The run coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Restores quota state, then starts the bus, coordinator and scheduler.
    /// Every event is logged at debug level.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = &self.context.config.quota_state_path {
            if path.exists() {
                if let Err(err) = self.context.quota.load_state(path) {
                    warn!(path = %path.display(), error = %err, "Could not restore quota state");
                }
            }
        }
        self.context.bus.attach_sink(Arc::new(LoggingEventSink::debug()));
        self.context.bus.start();
        self.coordinator.start();
        self.scheduler.start();
        info!(
            stages = ?self.coordinator.stage_names(),
            providers = ?self.context.providers.names(),
            "Pipeline system started"
        );
    }

    /// Requests a run of `job` immediately.
    pub async fn trigger_now(&self, job: &str) -> Result<TriggerOutcome, ScanflowError> {
        self.scheduler.trigger_now(job).await
    }

    /// Returns a status snapshot of every component.
    #[must_use]
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            bus: self.context.bus.metrics(),
            quotas: self.context.quota.status(),
            coordinator: self.coordinator.status(),
            scheduler: self.scheduler.status(),
        }
    }

    /// Stops every component.
    ///
    /// The scheduler stops first so no new runs are requested, then
    /// in-flight runs are cancelled and given their grace period, quota
    /// state is saved and finally the bus shuts down, delivering what is
    /// queued when `drain` is set.
    pub async fn shutdown(&self, drain: bool) -> SystemShutdownReport {
        info!(drain, "Pipeline system shutting down");
        self.scheduler.stop().await;
        let aborted_runs = self.coordinator.shutdown().await;
        self.context.cancellation.cancel("system shutdown");

        if let Some(path) = &self.context.config.quota_state_path {
            if let Err(err) = self.context.quota.save_state(path) {
                warn!(path = %path.display(), error = %err, "Could not save quota state");
            }
        }
        let bus = self.context.bus.shutdown(drain).await;
        info!(
            aborted_runs,
            delivered = bus.delivered,
            dropped = bus.dropped,
            "Pipeline system stopped"
        );
        SystemShutdownReport { aborted_runs, bus }
    }
}
