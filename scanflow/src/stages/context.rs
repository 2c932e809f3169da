//! Per-invocation context handed to a stage.

use crate::cancellation::CancellationToken;
use crate::core::{RunKey, StageOutput, StageResult, StageStatus};
use std::sync::Arc;

/// What a stage can see about the run it belongs to.
#[derive(Debug, Clone)]
pub struct StageContext {
    run_key: RunKey,
    stage_name: String,
    index: usize,
    cancellation: Arc<CancellationToken>,
    previous: Arc<[StageResult]>,
}

impl StageContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        run_key: RunKey,
        stage_name: impl Into<String>,
        index: usize,
        cancellation: Arc<CancellationToken>,
        previous: Vec<StageResult>,
    ) -> Self {
        Self {
            run_key,
            stage_name: stage_name.into(),
            index,
            cancellation,
            previous: previous.into(),
        }
    }

    /// Run key of the enclosing run.
    #[must_use]
    pub fn run_key(&self) -> &RunKey {
        &self.run_key
    }

    /// Name of the stage being executed.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Position of the stage in the pipeline.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cancellation token for the run.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Shorthand for `cancellation().is_cancelled()`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Results of the stages that ran before this one.
    #[must_use]
    pub fn previous_results(&self) -> &[StageResult] {
        &self.previous
    }

    /// Output of an earlier stage, if it succeeded.
    #[must_use]
    pub fn output_of(&self, stage_name: &str) -> Option<&StageOutput> {
        self.previous
            .iter()
            .find(|r| r.stage_name == stage_name && r.status == StageStatus::Succeeded)
            .and_then(|r| r.output.as_ref())
    }
}
