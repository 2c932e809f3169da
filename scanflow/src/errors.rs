//! Error types for scanflow.
//!
//! `ScanflowError` covers the orchestration core. Stages and providers report
//! through the narrower `StageError` and `ProviderError` so the coordinator can
//! tell a transient provider hiccup from a stage that is simply broken.

use crate::core::{EventPriority, RunKey, StageErrorInfo};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The main error type for scanflow operations.
#[derive(Debug, Error)]
pub enum ScanflowError {
    /// A priority queue stayed full for the whole publish timeout.
    #[error("Event bus overflow: {priority} queue full after {timeout_ms}ms")]
    Overflow {
        /// Priority of the rejected event.
        priority: EventPriority,
        /// How long the publisher waited.
        timeout_ms: u64,
    },

    /// The bus no longer accepts events.
    #[error("Event bus is shut down")]
    BusShutdown,

    /// A run with the same key is already in flight.
    #[error("Run '{run_key}' is already running")]
    AlreadyRunning {
        /// The contested run key.
        run_key: RunKey,
    },

    /// No job with this name is registered.
    #[error("Unknown job: {job}")]
    UnknownJob {
        /// The requested job name.
        job: String,
    },

    /// A provider has no calls left in its current window.
    #[error("Quota exhausted for provider '{provider}' ({limit} calls per window, resets at {window_end})")]
    QuotaExhausted {
        /// Provider name.
        provider: String,
        /// Window limit.
        limit: u64,
        /// When the current window ends.
        window_end: DateTime<Utc>,
    },

    /// None of a stage's providers could serve it.
    #[error("No provider available for stage '{stage}' (tried: {})", candidates.join(", "))]
    NoProviderAvailable {
        /// Stage name.
        stage: String,
        /// Providers the stage declared.
        candidates: Vec<String>,
    },

    /// A stage did not finish within its timeout.
    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout {
        /// Stage name.
        stage: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Work was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScanflowError {
    /// Stable, machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Overflow { .. } => "overflow",
            Self::BusShutdown => "bus_shutdown",
            Self::AlreadyRunning { .. } => "already_running",
            Self::UnknownJob { .. } => "unknown_job",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::NoProviderAvailable { .. } => "no_provider_available",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Converts the error into the info recorded on a stage result.
    #[must_use]
    pub fn to_info(&self) -> StageErrorInfo {
        StageErrorInfo::new(self.code(), self.to_string())
    }
}

/// Error returned by a provider invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The call may succeed against another provider or later on.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("Permanent provider error: {0}")]
    Permanent(String),

    /// The provider's quota ran out; another candidate may still have budget.
    #[error("Provider quota exhausted: {0}")]
    Exhausted(String),
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns true if another provider may be tried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Exhausted(_))
    }

    /// Returns true if the error came from the quota guard.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// Returns the bare message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Exhausted(m) => m,
        }
    }
}

/// Error returned by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The stage's provider call failed.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// The stage failed for its own reasons.
    #[error("Stage execution error: {0}")]
    Failed(String),

    /// The stage observed cancellation and stopped.
    #[error("Stage cancelled")]
    Cancelled,

    /// The stage did not finish in time.
    #[error("Stage timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },
}

impl StageError {
    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Stable, machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Provider(ProviderError::Transient(_)) => "provider_transient",
            Self::Provider(ProviderError::Permanent(_)) => "provider_permanent",
            Self::Provider(ProviderError::Exhausted(_)) => "quota_exhausted",
            Self::Failed(_) => "stage_failed",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "stage_timeout",
        }
    }

    /// Converts the error into the info recorded on a stage result.
    #[must_use]
    pub fn to_info(&self) -> StageErrorInfo {
        StageErrorInfo::new(self.code(), self.to_string())
    }
}

/// Error returned by a bus subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Error description.
    pub message: String,
}

impl HandlerError {
    /// Creates a new handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<ScanflowError> for HandlerError {
    fn from(err: ScanflowError) -> Self {
        Self::new(err.to_string())
    }
}

/// Configuration problems found while loading or validating settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A time of day could not be parsed.
    #[error("Job '{job}': invalid time of day '{value}' (expected HH:MM or HH:MM:SS)")]
    InvalidTimeOfDay {
        /// Job name.
        job: String,
        /// The rejected value.
        value: String,
    },

    /// A timezone name is not in the IANA database.
    #[error("Job '{job}': unknown timezone '{value}'")]
    UnknownTimezone {
        /// Job name.
        job: String,
        /// The rejected value.
        value: String,
    },

    /// Two entries share a name.
    #[error("Duplicate {kind} name: {name}")]
    Duplicate {
        /// Entry kind (`provider`, `job`).
        kind: &'static str,
        /// The repeated name.
        name: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
