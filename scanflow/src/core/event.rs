//! Bus events and their payloads.

use super::{EventPriority, RunKey, RunStatus, StageResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Closed set of event kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A pipeline run was requested.
    RunRequested,
    /// A pipeline run acquired its run key and started executing.
    RunStarted,
    /// A stage finished successfully.
    StageCompleted,
    /// A stage failed.
    StageFailed,
    /// An optional stage was bypassed.
    StageSkipped,
    /// A run reached `Succeeded` or `PartiallyFailed`.
    RunCompleted,
    /// A run was aborted.
    RunFailed,
    /// A run request was refused because its key was already active.
    RunRejected,
    /// A provider crossed its warning threshold.
    QuotaWarning,
    /// A stage moved on from a provider to the next candidate.
    ProviderFallback,
    /// A subscriber failed while handling an event.
    HandlerFailed,
    /// A long-lived component changed state.
    ComponentStatus,
}

impl EventKind {
    /// Default delivery priority for events of this kind.
    ///
    /// Run lifecycle and stage events share one tier so that the bus keeps
    /// them in publish order within a run.
    #[must_use]
    pub const fn default_priority(self) -> EventPriority {
        match self {
            Self::RunRequested => EventPriority::Critical,
            Self::QuotaWarning | Self::RunRejected => EventPriority::High,
            Self::HandlerFailed | Self::ComponentStatus => EventPriority::Low,
            Self::RunStarted
            | Self::StageCompleted
            | Self::StageFailed
            | Self::StageSkipped
            | Self::RunCompleted
            | Self::RunFailed
            | Self::ProviderFallback => EventPriority::Normal,
        }
    }

    /// Dotted event type name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunRequested => "run.requested",
            Self::RunStarted => "run.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageSkipped => "stage.skipped",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunRejected => "run.rejected",
            Self::QuotaWarning => "quota.warning",
            Self::ProviderFallback => "provider.fallback",
            Self::HandlerFailed => "bus.handler_failed",
            Self::ComponentStatus => "component.status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TriggerSource {
    /// A scheduled job became due.
    Schedule {
        /// Job name.
        job: String,
        /// Local calendar date the job fired for.
        scheduled_date: NaiveDate,
    },
    /// An operator called `trigger_now`.
    Manual {
        /// Job name.
        job: String,
    },
    /// Some other publisher requested the run.
    External {
        /// Free-form origin description.
        origin: String,
    },
}

/// Terminal summary of a run, shared by `RunCompleted` and `RunFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinished {
    /// Terminal run status.
    pub status: RunStatus,
    /// Results of every stage that was attempted, in pipeline order.
    pub stages: Vec<StageResult>,
    /// Total run time in milliseconds.
    pub duration_ms: f64,
    /// Why the run stopped early, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Why a stage moved on from a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The provider had no quota left in the current window.
    Exhausted,
    /// The provider returned a transient error.
    TransientError {
        /// Error message reported by the provider.
        message: String,
    },
}

/// Typed payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// See [`EventKind::RunRequested`].
    RunRequested {
        /// Identifies this particular request.
        request_id: Uuid,
        /// What caused the request.
        trigger: TriggerSource,
    },
    /// See [`EventKind::RunStarted`].
    RunStarted {
        /// Request that started the run.
        request_id: Uuid,
        /// Stage names in execution order.
        stages: Vec<String>,
    },
    /// See [`EventKind::StageCompleted`].
    StageCompleted {
        /// Position in the pipeline.
        index: usize,
        /// Stage result.
        result: StageResult,
    },
    /// See [`EventKind::StageFailed`].
    StageFailed {
        /// Position in the pipeline.
        index: usize,
        /// Stage result.
        result: StageResult,
        /// True when this failure ends the run.
        aborts_run: bool,
    },
    /// See [`EventKind::StageSkipped`].
    StageSkipped {
        /// Position in the pipeline.
        index: usize,
        /// Stage result.
        result: StageResult,
    },
    /// See [`EventKind::RunCompleted`].
    RunCompleted(RunFinished),
    /// See [`EventKind::RunFailed`].
    RunFailed(RunFinished),
    /// See [`EventKind::RunRejected`].
    RunRejected {
        /// Request that was refused.
        request_id: Uuid,
        /// Human readable reason.
        reason: String,
    },
    /// See [`EventKind::QuotaWarning`].
    QuotaWarning {
        /// Provider name.
        provider: String,
        /// Calls recorded in the current window.
        used: u64,
        /// Window limit.
        limit: u64,
        /// `used / limit`.
        usage_ratio: f64,
        /// When the current window ends.
        window_end: DateTime<Utc>,
    },
    /// See [`EventKind::ProviderFallback`].
    ProviderFallback {
        /// Stage that changed provider.
        stage: String,
        /// Provider that was given up on.
        from: String,
        /// Next candidate, if any remain.
        to: Option<String>,
        /// Why the stage moved on.
        reason: FallbackReason,
    },
    /// See [`EventKind::HandlerFailed`].
    HandlerFailed {
        /// Subscriber name.
        subscriber: String,
        /// Kind of the event being handled.
        failed_kind: EventKind,
        /// Id of the event being handled.
        failed_event_id: Uuid,
        /// Error description.
        error: String,
    },
    /// See [`EventKind::ComponentStatus`].
    ComponentStatus {
        /// Component name (`scheduler`, `coordinator`, `bus`).
        component: String,
        /// New state (`running`, `stopped`, ...).
        state: String,
    },
}

impl EventPayload {
    /// Returns the kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::RunRequested { .. } => EventKind::RunRequested,
            Self::RunStarted { .. } => EventKind::RunStarted,
            Self::StageCompleted { .. } => EventKind::StageCompleted,
            Self::StageFailed { .. } => EventKind::StageFailed,
            Self::StageSkipped { .. } => EventKind::StageSkipped,
            Self::RunCompleted(_) => EventKind::RunCompleted,
            Self::RunFailed(_) => EventKind::RunFailed,
            Self::RunRejected { .. } => EventKind::RunRejected,
            Self::QuotaWarning { .. } => EventKind::QuotaWarning,
            Self::ProviderFallback { .. } => EventKind::ProviderFallback,
            Self::HandlerFailed { .. } => EventKind::HandlerFailed,
            Self::ComponentStatus { .. } => EventKind::ComponentStatus,
        }
    }
}

/// A message carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, time-ordered id.
    pub id: Uuid,
    /// Delivery priority.
    pub priority: EventPriority,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
    /// Run the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_key: Option<RunKey>,
    /// Typed payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event with the default priority for its kind.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            priority: payload.kind().default_priority(),
            created_at: Utc::now(),
            run_key: None,
            payload,
        }
    }

    /// Overrides the delivery priority.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches the event to a run.
    #[must_use]
    pub fn for_run(mut self, run_key: RunKey) -> Self {
        self.run_key = Some(run_key);
        self
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Creates a `RunRequested` event.
    #[must_use]
    pub fn run_requested(run_key: RunKey, request_id: Uuid, trigger: TriggerSource) -> Self {
        Self::new(EventPayload::RunRequested { request_id, trigger }).for_run(run_key)
    }

    /// Returns the `(request_id, trigger)` pair of a `RunRequested` event.
    #[must_use]
    pub fn as_run_request(&self) -> Option<(Uuid, &TriggerSource)> {
        match &self.payload {
            EventPayload::RunRequested { request_id, trigger } => Some((*request_id, trigger)),
            _ => None,
        }
    }

    /// Returns the terminal summary of a `RunCompleted` or `RunFailed` event.
    #[must_use]
    pub fn as_run_finished(&self) -> Option<&RunFinished> {
        match &self.payload {
            EventPayload::RunCompleted(finished) | EventPayload::RunFailed(finished) => Some(finished),
            _ => None,
        }
    }

    /// Serializes the event for structured sinks.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "id": self.id,
                "kind": self.kind(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageOutput, StageResult};

    #[test]
    fn test_default_priorities() {
        let run_key = RunKey::new("daily:2026-03-29");
        let requested = Event::run_requested(
            run_key,
            Uuid::nil(),
            TriggerSource::Manual { job: "daily".into() },
        );
        assert_eq!(requested.priority, EventPriority::Critical);

        let failed = Event::new(EventPayload::HandlerFailed {
            subscriber: "audit".into(),
            failed_kind: EventKind::RunStarted,
            failed_event_id: Uuid::nil(),
            error: "boom".into(),
        });
        assert_eq!(failed.priority, EventPriority::Low);
    }

    #[test]
    fn test_payload_kind_matches_variant() {
        let finished = RunFinished {
            status: RunStatus::Succeeded,
            stages: vec![StageResult::succeeded("Report", StageOutput::empty())],
            duration_ms: 1.5,
            reason: None,
        };
        let event = Event::new(EventPayload::RunCompleted(finished));
        assert_eq!(event.kind(), EventKind::RunCompleted);
        assert_eq!(event.as_run_finished().map(|f| f.stages.len()), Some(1));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new(EventPayload::ComponentStatus {
            component: "scheduler".into(),
            state: "running".into(),
        })
        .for_run(RunKey::new("k"));

        let json = event.to_json();
        assert_eq!(json["kind"], "component_status");
        assert_eq!(json["payload"]["component"], "scheduler");
        assert_eq!(json["priority"], "low");
        assert_eq!(json["run_key"], "k");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::QuotaWarning.to_string(), "quota.warning");
    }
}
