//! Stage outputs and per-stage results recorded in a pipeline run.

use super::StageStatus;
use serde::{Deserialize, Serialize};

/// The domain payload produced by a successful stage.
///
/// The payload itself is opaque to the orchestration core; `produced_by`
/// is stamped by the coordinator with the provider the stage ran against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Domain payload.
    pub data: serde_json::Value,

    /// Provider that served the stage, if it declared provider dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
}

impl StageOutput {
    /// Creates an output carrying `data`.
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            produced_by: None,
        }
    }

    /// Creates an output with a null payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(serde_json::Value::Null)
    }

    /// Returns a copy of the output tagged with the serving provider.
    #[must_use]
    pub fn produced_by(mut self, provider: impl Into<String>) -> Self {
        self.produced_by = Some(provider.into());
        self
    }
}

/// Machine-readable error attached to a failed or skipped stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrorInfo {
    /// Stable error code (e.g. `quota_exhausted`, `stage_timeout`).
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl StageErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Result of one stage in a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,
    /// Current status.
    pub status: StageStatus,
    /// Error info for failed or skipped stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageErrorInfo>,
    /// Output for succeeded stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    /// Providers the stage was invoked against, in attempt order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: f64,
}

impl StageResult {
    /// Creates a pending result for a stage.
    #[must_use]
    pub fn pending(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            error: None,
            output: None,
            attempts: Vec::new(),
            duration_ms: 0.0,
        }
    }

    /// Creates a succeeded result.
    #[must_use]
    pub fn succeeded(stage_name: impl Into<String>, output: StageOutput) -> Self {
        Self {
            status: StageStatus::Succeeded,
            output: Some(output),
            ..Self::pending(stage_name)
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(stage_name: impl Into<String>, error: StageErrorInfo) -> Self {
        Self {
            status: StageStatus::Failed,
            error: Some(error),
            ..Self::pending(stage_name)
        }
    }

    /// Creates a skipped result.
    #[must_use]
    pub fn skipped(stage_name: impl Into<String>, reason: StageErrorInfo) -> Self {
        Self {
            status: StageStatus::Skipped,
            error: Some(reason),
            ..Self::pending(stage_name)
        }
    }

    /// Records the providers the stage was invoked against.
    #[must_use]
    pub fn with_attempts(mut self, attempts: Vec<String>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Records the execution time.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
