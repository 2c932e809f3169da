//! The scheduler tick loop and manual trigger.

use super::job::{JobStatus, ScheduledJob};
use crate::app::ApplicationContext;
use crate::cancellation::CancellationToken;
use crate::config::{JobConfig, SchedulerConfig};
use crate::core::{Event, EventPayload, RunKey, TriggerSource};
use crate::errors::ScanflowError;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of [`Scheduler::trigger_now`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A run request was published.
    Accepted {
        /// Key of the requested run.
        run_key: RunKey,
        /// Id of the published request.
        request_id: Uuid,
    },
    /// A run with the same key is in flight; nothing was published.
    AlreadyRunning {
        /// The contested key.
        run_key: RunKey,
    },
    /// No job with that name exists.
    UnknownJob {
        /// The requested name.
        job: String,
    },
}

/// Introspection view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// Whether the tick loop is running.
    pub running: bool,
    /// Scheduled fires since start.
    pub fired: u64,
    /// Per-job status, sorted by name.
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchedulerStateFile {
    saved_at: DateTime<Utc>,
    last_fired: BTreeMap<String, NaiveDate>,
}

/// Fires jobs at their local wall-clock time.
///
/// A fixed-interval tick recomputes every job's local time from the clock
/// rather than sleeping until a computed instant, so clock adjustments and
/// suspend/resume cannot cause a missed or doubled fire. A job whose time
/// passed while the process was asleep fires on the first tick after
/// resuming.
pub struct Scheduler {
    ctx: ApplicationContext,
    config: SchedulerConfig,
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
    cancellation: Arc<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
    fired: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler for the jobs in the context's configuration.
    pub fn new(ctx: &ApplicationContext) -> Result<Arc<Self>, ScanflowError> {
        let mut jobs = BTreeMap::new();
        for config in &ctx.config.jobs {
            let job = ScheduledJob::from_config(config)?;
            jobs.insert(job.name().to_string(), job);
        }
        Ok(Arc::new(Self {
            config: ctx.config.scheduler.clone(),
            cancellation: ctx.cancellation.child(),
            ctx: ctx.clone(),
            jobs: RwLock::new(jobs),
            worker: Mutex::new(None),
            fired: AtomicU64::new(0),
        }))
    }

    /// Starts the tick loop. Calling it again is a no-op.
    ///
    /// Last fired dates are restored from the configured state file first.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.cancellation.is_cancelled() {
            return;
        }
        if let Some(path) = &self.config.state_path {
            if path.exists() {
                if let Err(err) = self.load_state(path) {
                    warn!(path = %path.display(), error = %err, "Could not restore scheduler state");
                }
            }
        }

        let scheduler = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { scheduler.run_loop().await }));
        info!(
            jobs = self.jobs.read().len(),
            tick_interval_ms = self.config.tick_interval_ms,
            "Scheduler started"
        );
        self.announce("running");
    }

    /// Stops the tick loop and persists state.
    pub async fn stop(&self) {
        self.cancellation.cancel("scheduler stopped");
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(err) = handle.await {
                warn!(error = %err, "Scheduler loop ended abnormally");
            }
        }
        self.persist();
        info!(fired = self.fired.load(Ordering::Relaxed), "Scheduler stopped");
        self.announce("stopped");
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                () = self.cancellation.cancelled() => break,
            }
        }
        debug!("Scheduler loop exited");
    }

    /// Runs one tick against the context clock.
    pub async fn tick(&self) -> Vec<RunKey> {
        self.tick_at(self.ctx.clock.now()).await
    }

    /// Runs one tick as if the time were `now`.
    ///
    /// Fires every due job: its last fired date advances before the request
    /// is published, and is rolled back if publishing fails so the next tick
    /// retries. Returns the keys of the requested runs.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<RunKey> {
        let due: Vec<(String, NaiveDate, RunKey, Option<NaiveDate>)> = {
            let mut jobs = self.jobs.write();
            jobs.values_mut()
                .filter_map(|job| {
                    let date = job.due_date(now)?;
                    let previous = job.last_fired();
                    job.set_last_fired(Some(date));
                    Some((job.name().to_string(), date, job.run_key(date), previous))
                })
                .collect()
        };

        let mut requested = Vec::new();
        for (name, date, run_key, previous) in due {
            let request_id = Uuid::now_v7();
            if !self.ctx.runs.reserve(&run_key, request_id, now) {
                info!(job = %name, run_key = %run_key, "Scheduled run already in flight");
                continue;
            }
            let event = Event::run_requested(
                run_key.clone(),
                request_id,
                TriggerSource::Schedule {
                    job: name.clone(),
                    scheduled_date: date,
                },
            )
            .at(now);

            match self.ctx.bus.publish(event).await {
                Ok(()) => {
                    self.fired.fetch_add(1, Ordering::Relaxed);
                    info!(job = %name, run_key = %run_key, scheduled_date = %date, "Job fired");
                    requested.push(run_key);
                }
                Err(err) => {
                    self.ctx.runs.release(&run_key, request_id);
                    if let Some(job) = self.jobs.write().get_mut(&name) {
                        if job.last_fired() == Some(date) {
                            job.set_last_fired(previous);
                        }
                    }
                    warn!(job = %name, run_key = %run_key, error = %err, "Could not publish run request, will retry");
                }
            }
        }
        if !requested.is_empty() {
            self.persist();
        }
        requested
    }

    /// Requests a run of `job` now, bypassing its fire time.
    ///
    /// The run key is the one the job would use today. A key already held
    /// by a reserved or executing run yields
    /// [`TriggerOutcome::AlreadyRunning`] and nothing is published. Manual
    /// triggers do not touch the last fired date.
    pub async fn trigger_now(&self, job: &str) -> Result<TriggerOutcome, ScanflowError> {
        let now = self.ctx.clock.now();
        let run_key = {
            let jobs = self.jobs.read();
            let Some(scheduled) = jobs.get(job) else {
                info!(job, "Manual trigger for unknown job");
                return Ok(TriggerOutcome::UnknownJob { job: job.to_string() });
            };
            scheduled.run_key(scheduled.local_date(now))
        };

        let request_id = Uuid::now_v7();
        if !self.ctx.runs.reserve(&run_key, request_id, now) {
            info!(job, run_key = %run_key, "Manual trigger rejected, run in flight");
            return Ok(TriggerOutcome::AlreadyRunning { run_key });
        }
        let event = Event::run_requested(
            run_key.clone(),
            request_id,
            TriggerSource::Manual { job: job.to_string() },
        )
        .at(now);
        if let Err(err) = self.ctx.bus.publish(event).await {
            self.ctx.runs.release(&run_key, request_id);
            return Err(err);
        }
        info!(job, run_key = %run_key, request_id = %request_id, "Manual trigger accepted");
        Ok(TriggerOutcome::Accepted { run_key, request_id })
    }

    /// Adds a job or replaces its settings, keeping its last fired date.
    pub fn upsert_job(&self, config: &JobConfig) -> Result<(), ScanflowError> {
        let mut job = ScheduledJob::from_config(config)?;
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(&config.name) {
            job.set_last_fired(existing.last_fired());
        }
        info!(job = %config.name, time_of_day = %job.time_of_day(), timezone = %job.timezone(), "Job scheduled");
        jobs.insert(config.name.clone(), job);
        Ok(())
    }

    /// Removes a job. Returns false if it did not exist.
    pub fn remove_job(&self, name: &str) -> bool {
        self.jobs.write().remove(name).is_some()
    }

    /// Enables or disables scheduled fires of a job.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ScanflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(name).ok_or_else(|| ScanflowError::UnknownJob {
            job: name.to_string(),
        })?;
        job.set_enabled(enabled);
        info!(job = name, enabled, "Job toggled");
        Ok(())
    }

    /// Seeds a job's last fired date.
    pub fn seed_last_fired(&self, name: &str, date: NaiveDate) -> Result<(), ScanflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(name).ok_or_else(|| ScanflowError::UnknownJob {
            job: name.to_string(),
        })?;
        job.set_last_fired(Some(date));
        Ok(())
    }

    /// Returns a copy of one job.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<ScheduledJob> {
        self.jobs.read().get(name).cloned()
    }

    /// Returns a status snapshot.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let now = self.ctx.clock.now();
        SchedulerStatus {
            running: self.worker.lock().as_ref().is_some_and(|w| !w.is_finished()),
            fired: self.fired.load(Ordering::Relaxed),
            jobs: self.jobs.read().values().map(|job| job.status(now)).collect(),
        }
    }

    /// Writes last fired dates as JSON.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<(), ScanflowError> {
        let state = SchedulerStateFile {
            saved_at: self.ctx.clock.now(),
            last_fired: self
                .jobs
                .read()
                .values()
                .filter_map(|job| job.last_fired().map(|date| (job.name().to_string(), date)))
                .collect(),
        };
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(&state)?)?;
        debug!(path = %path.as_ref().display(), "Scheduler state saved");
        Ok(())
    }

    /// Restores last fired dates. Unknown jobs are ignored.
    ///
    /// Returns the number of jobs restored.
    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<usize, ScanflowError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let state: SchedulerStateFile = serde_json::from_str(&raw)?;
        let mut jobs = self.jobs.write();
        let mut restored = 0;
        for (name, date) in state.last_fired {
            match jobs.get_mut(&name) {
                Some(job) => {
                    job.set_last_fired(Some(date));
                    restored += 1;
                }
                None => debug!(job = %name, "Ignoring state for unknown job"),
            }
        }
        info!(path = %path.as_ref().display(), restored, "Scheduler state restored");
        Ok(restored)
    }

    fn persist(&self) {
        if let Some(path) = &self.config.state_path {
            if let Err(err) = self.save_state(path) {
                warn!(path = %path.display(), error = %err, "Could not save scheduler state");
            }
        }
    }

    fn announce(&self, state: &str) {
        let event = Event::new(EventPayload::ComponentStatus {
            component: "scheduler".to_string(),
            state: state.to_string(),
        });
        if let Err(err) = self.ctx.bus.try_publish(event) {
            debug!(error = %err, state, "Could not publish scheduler status");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.read().keys().collect::<Vec<_>>())
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
