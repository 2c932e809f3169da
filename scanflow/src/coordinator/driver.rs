//! The coordinator: accepts run requests and drives stages in order.

use super::registry::RunRegistry;
use super::run::PipelineRun;
use crate::app::ApplicationContext;
use crate::cancellation::CancellationToken;
use crate::config::CoordinatorConfig;
use crate::core::{
    Event, EventKind, EventPayload, FallbackReason, RunFinished, RunKey, RunStatus, StageOutput,
    StageResult, StageStatus,
};
use crate::errors::{HandlerError, ProviderError, ScanflowError, StageError};
use crate::events::{EventHandler, KindFilter, SubscriptionId};
use crate::observability::{run_span, stage_span};
use crate::stages::{ProviderHandle, Stage, StageContext};
use crate::utils::{duration_ms, elapsed_ms};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Default)]
struct RunCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    partially_failed: AtomicU64,
    failed: AtomicU64,
}

impl RunCounters {
    fn record_terminal(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Succeeded => &self.succeeded,
            RunStatus::PartiallyFailed => &self.partially_failed,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Introspection view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    /// Stage names in execution order.
    pub stages: Vec<String>,
    /// Keys of runs currently executing.
    pub active_runs: Vec<RunKey>,
    /// Whether new runs are accepted.
    pub accepting: bool,
    /// Runs accepted since start.
    pub accepted: u64,
    /// Requests refused by single-flight or shutdown.
    pub rejected: u64,
    /// Runs that finished `Succeeded`.
    pub succeeded: u64,
    /// Runs that finished `PartiallyFailed`.
    pub partially_failed: u64,
    /// Runs that finished `Failed`.
    pub failed: u64,
}

/// Drives pipeline runs.
///
/// Runs for different keys execute concurrently on their own tasks; a
/// request for a key that is already held is refused, never queued. Within
/// a run, stages execute strictly in declaration order and their events are
/// published before the run's terminal event.
pub struct Coordinator {
    ctx: ApplicationContext,
    stages: Vec<Arc<dyn Stage>>,
    config: CoordinatorConfig,
    cancellation: Arc<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    closed: AtomicBool,
    counters: RunCounters,
}

impl Coordinator {
    /// Creates a coordinator for the given pipeline.
    #[must_use]
    pub fn new(ctx: &ApplicationContext, stages: Vec<Arc<dyn Stage>>) -> Arc<Self> {
        Arc::new(Self {
            config: ctx.config.coordinator.clone(),
            cancellation: ctx.cancellation.child(),
            ctx: ctx.clone(),
            stages,
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
            counters: RunCounters::default(),
        })
    }

    /// Subscribes to `RunRequested` events. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let handler = RunRequestHandler {
            coordinator: Arc::downgrade(self),
        };
        *subscription = Some(
            self.ctx
                .bus
                .subscribe(KindFilter::only(EventKind::RunRequested), Arc::new(handler)),
        );
        info!(stages = ?self.stage_names(), "Coordinator started");
        self.announce("running");
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// The shared run registry.
    #[must_use]
    pub fn runs(&self) -> &RunRegistry {
        &self.ctx.runs
    }

    /// Keys of runs currently executing.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunKey> {
        self.ctx.runs.active_keys()
    }

    /// Returns a status snapshot.
    #[must_use]
    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            stages: self.stage_names(),
            active_runs: self.active_runs(),
            accepting: !self.closed.load(Ordering::SeqCst),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            partially_failed: self.counters.partially_failed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs the pipeline for `run_key` on the caller's task and returns the
    /// terminal summary. Events are published as for bus-delivered requests.
    pub async fn run(&self, run_key: RunKey) -> Result<RunFinished, ScanflowError> {
        let request_id = Uuid::now_v7();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScanflowError::Cancelled("coordinator is shut down".to_string()));
        }
        self.claim(&run_key, request_id)?;
        let span = run_span(run_key.as_str(), &request_id.to_string());
        Ok(self.drive(run_key, request_id).instrument(span).await)
    }

    /// Accepts a request and executes it on a new task.
    ///
    /// Fails with [`ScanflowError::AlreadyRunning`] if another request holds
    /// the key. A reservation made for the same `request_id` is honoured.
    pub fn submit(self: &Arc<Self>, run_key: RunKey, request_id: Uuid) -> Result<(), ScanflowError> {
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScanflowError::Cancelled("coordinator is shut down".to_string()));
        }
        self.claim(&run_key, request_id)?;

        let coordinator = Arc::clone(self);
        let span = run_span(run_key.as_str(), &request_id.to_string());
        let handle = tokio::spawn(
            async move {
                coordinator.drive(run_key, request_id).await;
            }
            .instrument(span),
        );
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Stops accepting runs, cancels in-flight stages and waits for the
    /// runs to wind down. Returns the number of runs that had to be aborted.
    ///
    /// Reserved keys whose request was never picked up get a `RunFailed`
    /// terminal event with reason `cancelled` and are released.
    pub async fn shutdown(&self) -> usize {
        let mut pending: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *tasks)
        };
        if let Some(id) = self.subscription.lock().take() {
            self.ctx.bus.unsubscribe(id);
        }
        self.cancellation.cancel("coordinator shutdown");

        // Requests still queued on the bus will never reach a handler.
        for (run_key, request_id) in self.ctx.runs.take_reserved() {
            self.fail_unclaimed(run_key, request_id).await;
        }

        pending.retain(|task| !task.is_finished());
        let in_flight = pending.len();
        // One grace period for stages to observe cancellation, one for the
        // runs to publish their terminal events.
        let wait = self.config.shutdown_grace().saturating_mul(2);
        let mut aborted = 0;
        if tokio::time::timeout(wait, futures::future::join_all(pending.iter_mut()))
            .await
            .is_err()
        {
            for task in &pending {
                if !task.is_finished() {
                    task.abort();
                    aborted += 1;
                }
            }
            warn!(aborted, "Coordinator shutdown grace elapsed, runs aborted");
        }
        info!(in_flight, aborted, "Coordinator stopped");
        self.announce("stopped");
        aborted
    }

    fn claim(&self, run_key: &RunKey, request_id: Uuid) -> Result<(), ScanflowError> {
        if self.ctx.runs.claim(run_key, request_id, self.ctx.clock.now()) {
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            info!(run_key = %run_key, request_id = %request_id, "Run accepted");
            Ok(())
        } else {
            Err(ScanflowError::AlreadyRunning {
                run_key: run_key.clone(),
            })
        }
    }

    fn reject(&self, run_key: &RunKey, request_id: Uuid, err: &ScanflowError) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        info!(run_key = %run_key, request_id = %request_id, reason = %err, "Run rejected");
        let event = Event::new(EventPayload::RunRejected {
            request_id,
            reason: err.to_string(),
        })
        .for_run(run_key.clone());
        if let Err(publish_err) = self.ctx.bus.try_publish(event) {
            warn!(run_key = %run_key, error = %publish_err, "Could not publish run rejection");
        }
    }

    async fn fail_unclaimed(&self, run_key: RunKey, request_id: Uuid) {
        let mut run = PipelineRun::new(run_key.clone(), request_id, &self.stage_names());
        run.abort("cancelled");
        let status = run.finish();
        self.counters.record_terminal(status);
        info!(run_key = %run_key, request_id = %request_id, "Accepted run cancelled before it started");
        let finished = run.into_finished();
        self.publish(Event::new(EventPayload::RunFailed(finished)).for_run(run_key))
            .await;
    }

    async fn drive(&self, run_key: RunKey, request_id: Uuid) -> RunFinished {
        let mut run = PipelineRun::new(run_key.clone(), request_id, &self.stage_names());
        self.execute_run(&mut run).await;
        let status = run.finish();

        // Released before the terminal event so its observers can re-trigger.
        self.ctx.runs.release(&run_key, request_id);
        let finished = run.into_finished();
        self.counters.record_terminal(status);
        info!(
            run_key = %run_key,
            status = %status,
            stages = finished.stages.len(),
            duration_ms = finished.duration_ms,
            "Run finished"
        );

        let payload = if status == RunStatus::Failed {
            EventPayload::RunFailed(finished.clone())
        } else {
            EventPayload::RunCompleted(finished.clone())
        };
        self.publish(Event::new(payload).for_run(run_key)).await;
        finished
    }

    async fn execute_run(&self, run: &mut PipelineRun) {
        if self.cancellation.is_cancelled() {
            info!(run_key = %run.run_key(), "Run cancelled before any stage started");
            run.abort("cancelled");
            return;
        }
        run.start();
        self.publish(
            Event::new(EventPayload::RunStarted {
                request_id: run.request_id(),
                stages: self.stage_names(),
            })
            .for_run(run.run_key().clone()),
        )
        .await;

        for (index, stage) in self.stages.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                run.abort("cancelled");
                break;
            }
            run.begin_stage(index);
            debug!(run_key = %run.run_key(), stage = stage.name(), index, "Stage started");

            let result = self
                .run_stage(index, stage.as_ref(), run)
                .instrument(stage_span(stage.name(), index))
                .await;
            let cancelled = self.cancellation.is_cancelled();
            let aborts_run =
                result.status == StageStatus::Failed && (stage.abort_pipeline_on_failure() || cancelled);
            info!(
                run_key = %run.run_key(),
                stage = stage.name(),
                status = %result.status,
                error = result.error_code().unwrap_or(""),
                duration_ms = result.duration_ms,
                "Stage finished"
            );

            let payload = match result.status {
                StageStatus::Failed => EventPayload::StageFailed {
                    index,
                    result: result.clone(),
                    aborts_run,
                },
                StageStatus::Skipped => EventPayload::StageSkipped {
                    index,
                    result: result.clone(),
                },
                _ => EventPayload::StageCompleted {
                    index,
                    result: result.clone(),
                },
            };
            run.record(index, result);
            self.publish(Event::new(payload).for_run(run.run_key().clone())).await;

            if aborts_run {
                let reason = if cancelled {
                    "cancelled".to_string()
                } else {
                    format!("stage '{}' failed", stage.name())
                };
                run.abort(reason);
                break;
            }
        }
    }

    async fn run_stage(&self, index: usize, stage: &dyn Stage, run: &PipelineRun) -> StageResult {
        let started = Instant::now();
        let ctx = StageContext::new(
            run.run_key().clone(),
            stage.name(),
            index,
            Arc::clone(&self.cancellation),
            run.completed_results(),
        );
        let candidates = stage.requires_providers();
        let result = if candidates.is_empty() {
            match self.invoke(stage, &ctx, None).await {
                Ok(output) => StageResult::succeeded(stage.name(), output),
                Err(err) => StageResult::failed(stage.name(), err.to_info()),
            }
        } else {
            self.run_with_providers(stage, &ctx, candidates).await
        };
        result.with_duration_ms(elapsed_ms(started))
    }

    /// Tries candidates in order until one succeeds.
    ///
    /// Exhausted candidates are passed over; a transient error moves on to
    /// the next candidate; a permanent error or any other stage error fails
    /// the stage at once.
    async fn run_with_providers(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        candidates: &[String],
    ) -> StageResult {
        let name = stage.name();
        let mut remaining: Vec<&String> = candidates.iter().collect();
        let mut attempts = Vec::new();
        let mut last_error: Option<StageError> = None;

        loop {
            let selected = self.ctx.quota.select_provider(&remaining);
            let position = selected
                .as_ref()
                .and_then(|s| remaining.iter().position(|c| *c == s))
                .unwrap_or(remaining.len());
            for (i, exhausted) in remaining[..position].iter().enumerate() {
                let next = remaining.get(i + 1).map(|s| (*s).clone());
                self.publish_fallback(ctx, exhausted, next, FallbackReason::Exhausted).await;
            }

            let Some(provider) = selected else {
                let result = match last_error {
                    Some(err) => StageResult::failed(name, err.to_info()),
                    None => {
                        let err = ScanflowError::NoProviderAvailable {
                            stage: name.to_string(),
                            candidates: candidates.to_vec(),
                        };
                        if stage.is_mandatory() {
                            StageResult::failed(name, err.to_info())
                        } else {
                            StageResult::skipped(name, err.to_info())
                        }
                    }
                };
                return result.with_attempts(attempts);
            };
            remaining.drain(..=position);
            attempts.push(provider.clone());

            let handle = ProviderHandle::new(
                provider.as_str(),
                self.ctx.providers.get(&provider),
                Arc::clone(&self.ctx.quota),
                Arc::clone(&self.ctx.bus),
                ctx.run_key().clone(),
            );
            match self.invoke(stage, ctx, Some(&handle)).await {
                Ok(output) => {
                    let output = if output.produced_by.is_some() {
                        output
                    } else {
                        output.produced_by(provider.as_str())
                    };
                    return StageResult::succeeded(name, output).with_attempts(attempts);
                }
                Err(StageError::Provider(ProviderError::Exhausted(message)))
                    if !self.cancellation.is_cancelled() =>
                {
                    // Ran out mid-stage; treated like a candidate exhausted up front.
                    debug!(stage = name, provider = %provider, error = %message, "Provider quota ran out");
                    let next = remaining.first().map(|s| (*s).clone());
                    self.publish_fallback(ctx, &provider, next, FallbackReason::Exhausted)
                        .await;
                }
                Err(StageError::Provider(ProviderError::Transient(message)))
                    if !self.cancellation.is_cancelled() =>
                {
                    warn!(stage = name, provider = %provider, error = %message, "Transient provider error");
                    let next = remaining.first().map(|s| (*s).clone());
                    self.publish_fallback(
                        ctx,
                        &provider,
                        next,
                        FallbackReason::TransientError {
                            message: message.clone(),
                        },
                    )
                    .await;
                    last_error = Some(StageError::Provider(ProviderError::Transient(message)));
                }
                Err(err) => return StageResult::failed(name, err.to_info()).with_attempts(attempts),
            }
        }
    }

    /// Executes one attempt, bounded by the stage timeout.
    ///
    /// On cancellation the stage gets the shutdown grace period to notice
    /// and return; after that the attempt counts as cancelled.
    async fn invoke(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        provider: Option<&ProviderHandle>,
    ) -> Result<StageOutput, StageError> {
        let timeout = stage.timeout().unwrap_or_else(|| self.config.stage_timeout());
        let mut execution = AssertUnwindSafe(stage.execute(ctx, provider))
            .catch_unwind()
            .map(|outcome| {
                outcome.unwrap_or_else(|_| Err(StageError::failed("stage panicked")))
            })
            .boxed();

        tokio::select! {
            result = &mut execution => result,
            () = tokio::time::sleep(timeout) => {
                warn!(stage = stage.name(), timeout_ms = duration_ms(timeout), "Stage timed out");
                Err(StageError::Timeout { timeout_ms: duration_ms(timeout) })
            }
            () = self.cancellation.cancelled() => {
                match tokio::time::timeout(self.config.shutdown_grace(), &mut execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!(stage = stage.name(), "Stage ignored cancellation");
                        Err(StageError::Cancelled)
                    }
                }
            }
        }
    }

    async fn publish_fallback(
        &self,
        ctx: &StageContext,
        from: &str,
        to: Option<String>,
        reason: FallbackReason,
    ) {
        info!(stage = ctx.stage_name(), from, to = ?to, reason = ?reason, "Provider fallback");
        let event = Event::new(EventPayload::ProviderFallback {
            stage: ctx.stage_name().to_string(),
            from: from.to_string(),
            to,
            reason,
        })
        .for_run(ctx.run_key().clone());
        self.publish(event).await;
    }

    async fn publish(&self, event: Event) {
        let kind = event.kind();
        if let Err(err) = self.ctx.bus.publish(event).await {
            warn!(kind = %kind, error = %err, "Could not publish coordinator event");
        }
    }

    fn announce(&self, state: &str) {
        let event = Event::new(EventPayload::ComponentStatus {
            component: "coordinator".to_string(),
            state: state.to_string(),
        });
        if let Err(err) = self.ctx.bus.try_publish(event) {
            debug!(error = %err, state, "Could not publish coordinator status");
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("stages", &self.stage_names())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Bus subscriber that feeds `RunRequested` events into the coordinator.
struct RunRequestHandler {
    coordinator: Weak<Coordinator>,
}

#[async_trait]
impl EventHandler for RunRequestHandler {
    fn name(&self) -> &str {
        "coordinator"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Ok(());
        };
        let Some((request_id, trigger)) = event.as_run_request() else {
            return Ok(());
        };
        let Some(run_key) = event.run_key.clone() else {
            return Err(HandlerError::new("run request without a run key"));
        };
        debug!(run_key = %run_key, request_id = %request_id, trigger = ?trigger, "Run requested");
        if let Err(err) = coordinator.submit(run_key.clone(), request_id) {
            coordinator.reject(&run_key, request_id, &err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, CoordinatorConfig, ProviderQuotaConfig, SystemConfig};
    use crate::events::CollectingEventSink;
    use crate::stages::FnStage;
    use crate::testing::{BlockingStage, ScriptedStage};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn context(providers: &[(&str, u64)]) -> ApplicationContext {
        let mut config = SystemConfig::default()
            .with_bus(BusConfig::default().with_publish_timeout(Duration::from_millis(100)))
            .with_coordinator(
                CoordinatorConfig::default()
                    .with_stage_timeout(Duration::from_millis(500))
                    .with_shutdown_grace(Duration::from_millis(200)),
            );
        for (name, limit) in providers {
            config = config.with_provider(ProviderQuotaConfig::new(*name, *limit));
        }
        ApplicationContext::new(config).unwrap()
    }

    fn statuses(finished: &RunFinished) -> Vec<(String, StageStatus)> {
        finished
            .stages
            .iter()
            .map(|r| (r.stage_name.clone(), r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_run_all_stages_succeed() {
        let ctx = context(&[]);
        let coordinator = Coordinator::new(
            &ctx,
            vec![ScriptedStage::new("Transform").into_arc(), ScriptedStage::new("Report").into_arc()],
        );

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(
            statuses(&finished),
            vec![
                ("Transform".to_string(), StageStatus::Succeeded),
                ("Report".to_string(), StageStatus::Succeeded),
            ]
        );
        assert!(ctx.runs.is_empty());
        assert_eq!(coordinator.status().succeeded, 1);
    }

    #[tokio::test]
    async fn test_exhausted_primary_falls_back() {
        let ctx = context(&[("primary", 0), ("secondary", 10)]);
        let fetch = ScriptedStage::new("Fetch").requires(["primary", "secondary"]);
        let coordinator = Coordinator::new(&ctx, vec![fetch.clone().into_arc()]);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        let result = &finished.stages[0];
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.attempts, vec!["secondary".to_string()]);
        assert_eq!(
            result.output.as_ref().and_then(|o| o.produced_by.clone()),
            Some("secondary".to_string())
        );
        assert_eq!(fetch.providers_seen(), vec![Some("secondary".to_string())]);
    }

    #[tokio::test]
    async fn test_transient_error_tries_next_provider() {
        let ctx = context(&[("primary", 10), ("secondary", 10)]);
        let fetch = ScriptedStage::new("Fetch")
            .requires(["primary", "secondary"])
            .fail_with_provider("primary", ProviderError::transient("503"));
        let coordinator = Coordinator::new(&ctx, vec![fetch.clone().into_arc()]);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.stages[0].attempts, vec!["primary".to_string(), "secondary".to_string()]);
        assert_eq!(ctx.quota.snapshot("primary").map(|s| s.used), Some(1));
        assert_eq!(ctx.quota.snapshot("secondary").map(|s| s.used), Some(1));
    }

    #[tokio::test]
    async fn test_permanent_error_does_not_fall_back() {
        let ctx = context(&[("primary", 10), ("secondary", 10)]);
        let fetch = ScriptedStage::new("Fetch")
            .requires(["primary", "secondary"])
            .fail_with_provider("primary", ProviderError::permanent("bad symbol"));
        let coordinator = Coordinator::new(&ctx, vec![fetch.clone().into_arc()]);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::PartiallyFailed);
        assert_eq!(finished.stages[0].error_code(), Some("provider_permanent"));
        assert_eq!(fetch.call_count(), 1);
    }

    #[tokio::test]
    async fn test_optional_stage_skipped_without_provider() {
        let ctx = context(&[("news", 0)]);
        let coordinator = Coordinator::new(
            &ctx,
            vec![
                ScriptedStage::new("News").requires(["news"]).optional().into_arc(),
                ScriptedStage::new("Report").into_arc(),
            ],
        );

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.stages[0].status, StageStatus::Skipped);
        assert_eq!(finished.stages[0].error_code(), Some("no_provider_available"));
    }

    #[tokio::test]
    async fn test_quota_running_out_mid_stage_skips_optional() {
        let ctx = context(&[("news", 1)]);
        let two_calls = |_ctx: StageContext, provider: Option<ProviderHandle>| async move {
            let handle = provider.ok_or_else(|| StageError::failed("no provider"))?;
            handle.record_call()?;
            handle.record_call()?;
            Ok::<_, StageError>(StageOutput::empty())
        };
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(FnStage::new("News", two_calls).requires(["news"]).optional()),
            Arc::new(FnStage::new("Headlines", two_calls).requires(["news"])),
        ];
        let coordinator = Coordinator::new(&ctx, stages);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.stages[0].status, StageStatus::Skipped);
        assert_eq!(finished.stages[0].error_code(), Some("no_provider_available"));
        assert_eq!(finished.stages[0].attempts, vec!["news".to_string()]);
        assert_eq!(finished.stages[1].status, StageStatus::Failed);
        assert_eq!(finished.stages[1].error_code(), Some("no_provider_available"));
        assert_eq!(finished.status, RunStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_stage_timeout_is_failure() {
        let ctx = context(&[]);
        let slow = BlockingStage::new("Slow").with_timeout(Duration::from_millis(20));
        let coordinator = Coordinator::new(&ctx, vec![slow.into_arc(), ScriptedStage::new("Report").into_arc()]);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::PartiallyFailed);
        assert_eq!(finished.stages[0].error_code(), Some("stage_timeout"));
        assert_eq!(finished.stages[1].status, StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let ctx = context(&[]);
        let coordinator = Coordinator::new(&ctx, vec![ScriptedStage::new("Boom").panics().into_arc()]);

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.stages[0].status, StageStatus::Failed);
        assert!(ctx.runs.is_empty());
    }

    #[tokio::test]
    async fn test_direct_run_respects_single_flight() {
        let ctx = context(&[]);
        let coordinator = Coordinator::new(&ctx, vec![ScriptedStage::new("Report").into_arc()]);
        let key = RunKey::new("r1");
        assert!(ctx.runs.reserve(&key, Uuid::new_v4(), ctx.clock.now()));

        let err = coordinator.run(key).await.unwrap_err();
        assert!(matches!(err, ScanflowError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let ctx = context(&[]);
        let report = ScriptedStage::new("Report");
        let coordinator = Coordinator::new(&ctx, vec![report.clone().into_arc()]);
        ctx.cancellation.cancel("shutdown");

        let finished = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert!(finished.stages.is_empty());
        assert_eq!(finished.reason.as_deref(), Some("cancelled"));
        assert_eq!(report.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bus_request_rejected_while_running() {
        let ctx = context(&[]);
        let sink = Arc::new(CollectingEventSink::new());
        ctx.bus.attach_sink(sink.clone());
        ctx.bus.start();

        let gate = BlockingStage::new("Hold");
        let coordinator = Coordinator::new(&ctx, vec![gate.clone().into_arc()]);
        coordinator.start();

        let key = RunKey::new("daily:2026-03-02");
        let trigger = crate::core::TriggerSource::External { origin: "test".into() };
        ctx.bus
            .publish(Event::run_requested(key.clone(), Uuid::now_v7(), trigger.clone()))
            .await
            .unwrap();
        assert!(gate.wait_started(Duration::from_secs(1)).await);

        ctx.bus
            .publish(Event::run_requested(key.clone(), Uuid::now_v7(), trigger))
            .await
            .unwrap();
        let rejected = sink.wait_for_kind(EventKind::RunRejected, Duration::from_secs(1)).await;
        assert!(rejected.is_some());
        assert_eq!(coordinator.active_runs(), vec![key]);

        gate.release();
        let done = sink.wait_for_kind(EventKind::RunCompleted, Duration::from_secs(1)).await;
        assert!(done.is_some());
        assert_eq!(coordinator.status().rejected, 1);

        coordinator.shutdown().await;
        ctx.bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_reserved_request_still_queued() {
        let ctx = context(&[]);
        let sink = Arc::new(CollectingEventSink::new());
        ctx.bus.attach_sink(sink.clone());
        let report = ScriptedStage::new("Report");
        let coordinator = Coordinator::new(&ctx, vec![report.clone().into_arc()]);
        coordinator.start();

        // The bus worker is not running yet, so the request stays queued.
        let key = RunKey::new("manual:2026-03-02");
        let request_id = Uuid::now_v7();
        assert!(ctx.runs.reserve(&key, request_id, ctx.clock.now()));
        let trigger = crate::core::TriggerSource::Manual { job: "manual".into() };
        ctx.bus
            .publish(Event::run_requested(key.clone(), request_id, trigger))
            .await
            .unwrap();

        assert_eq!(coordinator.shutdown().await, 0);
        assert!(ctx.runs.is_empty());

        ctx.bus.start();
        let failed = sink
            .wait_for_kind(EventKind::RunFailed, Duration::from_secs(1))
            .await
            .expect("terminal event for the queued request");
        assert_eq!(failed.run_key.as_ref(), Some(&key));
        let finished = failed.as_run_finished().unwrap();
        assert_eq!(finished.reason.as_deref(), Some("cancelled"));
        assert!(finished.stages.is_empty());
        assert_eq!(report.call_count(), 0);
        assert_eq!(coordinator.status().failed, 1);
        ctx.bus.shutdown(true).await;
    }
}
