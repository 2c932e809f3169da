//! Live state of one pipeline run.

use crate::core::{RunFinished, RunKey, RunStatus, StageResult, StageStatus};
use std::time::Instant;
use uuid::Uuid;

/// A run owned by the coordinator from acceptance until its terminal event.
///
/// Observers never see this value; they see the events built from it.
#[derive(Debug)]
pub struct PipelineRun {
    run_key: RunKey,
    request_id: Uuid,
    status: RunStatus,
    results: Vec<StageResult>,
    started: Instant,
    reason: Option<String>,
}

impl PipelineRun {
    /// Creates an accepted run with one pending result per stage.
    #[must_use]
    pub fn new<S: AsRef<str>>(run_key: RunKey, request_id: Uuid, stage_names: &[S]) -> Self {
        Self {
            run_key,
            request_id,
            status: RunStatus::Accepted,
            results: stage_names
                .iter()
                .map(|name| StageResult::pending(name.as_ref()))
                .collect(),
            started: Instant::now(),
            reason: None,
        }
    }

    /// Run key.
    #[must_use]
    pub fn run_key(&self) -> &RunKey {
        &self.run_key
    }

    /// Request that created the run.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the run to `Running`.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    /// Marks stage `index` as running.
    pub fn begin_stage(&mut self, index: usize) {
        if let Some(result) = self.results.get_mut(index) {
            result.status = StageStatus::Running;
        }
    }

    /// Stores the outcome of stage `index`.
    pub fn record(&mut self, index: usize, result: StageResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = result;
        }
    }

    /// Results of the stages that finished so far.
    #[must_use]
    pub fn completed_results(&self) -> Vec<StageResult> {
        self.results
            .iter()
            .filter(|r| r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Fails the run without running anything else.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.reason = Some(reason.into());
    }

    /// Settles the terminal status after the last stage.
    ///
    /// An aborted run stays `Failed`; otherwise any failed stage makes the
    /// run `PartiallyFailed`.
    pub fn finish(&mut self) -> RunStatus {
        if self.status != RunStatus::Failed {
            let any_failed = self.results.iter().any(|r| r.status == StageStatus::Failed);
            self.status = if any_failed {
                RunStatus::PartiallyFailed
            } else {
                RunStatus::Succeeded
            };
        }
        self.status
    }

    /// Builds the terminal summary. Stages that never started are left out.
    #[must_use]
    pub fn into_finished(self) -> RunFinished {
        RunFinished {
            status: self.status,
            stages: self
                .results
                .into_iter()
                .filter(|r| r.status.is_terminal())
                .collect(),
            duration_ms: crate::utils::elapsed_ms(self.started),
            reason: self.reason,
        }
    }
}
