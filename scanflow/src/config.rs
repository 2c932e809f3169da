//! Configuration types for the pipeline system.
//!
//! Every field has a serde default so a partial JSON document (or `{}`)
//! produces a usable configuration.

use crate::errors::{ConfigError, ScanflowError};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of each priority queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long `publish` waits for room in a full queue.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Upper bound on a single handler invocation.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// How long a draining shutdown waits for the queues to empty.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Whether handler failures are published as `HandlerFailed` events.
    #[serde(default = "default_true")]
    pub emit_handler_diagnostics: bool,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_publish_timeout_ms() -> u64 {
    1_000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            emit_handler_diagnostics: default_true(),
        }
    }
}

impl BusConfig {
    /// Sets the per-queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the publish timeout.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout_ms = crate::utils::duration_ms(timeout);
        self
    }

    /// Sets the handler timeout.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = crate::utils::duration_ms(timeout);
        self
    }

    /// Sets the drain timeout.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = crate::utils::duration_ms(timeout);
        self
    }

    /// Gets the publish timeout as a Duration.
    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Gets the handler timeout as a Duration.
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Gets the drain timeout as a Duration.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Longest accepted quota window: one leap year.
pub const MAX_QUOTA_WINDOW_SECONDS: u64 = 366 * 86_400;

/// Call budget for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuotaConfig {
    /// Provider name.
    pub name: String,
    /// Calls allowed per window.
    pub limit: u64,
    /// Window length in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Usage ratio at which `QuotaWarning` fires.
    #[serde(default = "default_warn_ratio")]
    pub warn_threshold_ratio: f64,
}

fn default_window_seconds() -> u64 {
    86_400
}

fn default_warn_ratio() -> f64 {
    0.9
}

impl ProviderQuotaConfig {
    /// Creates a daily budget with the default warning threshold.
    #[must_use]
    pub fn new(name: impl Into<String>, limit: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            window_seconds: default_window_seconds(),
            warn_threshold_ratio: default_warn_ratio(),
        }
    }

    /// Sets the window length.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_seconds = window.as_secs();
        self
    }

    /// Sets the warning threshold.
    #[must_use]
    pub fn with_warn_ratio(mut self, ratio: f64) -> Self {
        self.warn_threshold_ratio = ratio;
        self
    }

    /// Gets the window as a Duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("providers.name", "must not be empty"));
        }
        if self.window_seconds == 0 {
            return Err(ConfigError::invalid(
                format!("providers.{}.window_seconds", self.name),
                "must be positive",
            ));
        }
        if self.window_seconds > MAX_QUOTA_WINDOW_SECONDS {
            return Err(ConfigError::invalid(
                format!("providers.{}.window_seconds", self.name),
                format!("must be at most {MAX_QUOTA_WINDOW_SECONDS}"),
            ));
        }
        if !(self.warn_threshold_ratio > 0.0 && self.warn_threshold_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                format!("providers.{}.warn_threshold_ratio", self.name),
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// A recurring daily job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name, also the argument to `trigger_now`.
    pub name: String,
    /// Local fire time, `HH:MM` or `HH:MM:SS`.
    pub time_of_day: String,
    /// IANA timezone the fire time is expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Run key template; `{date}` is replaced with the local date,
    /// otherwise `:<date>` is appended. Defaults to the job name.
    #[serde(default)]
    pub run_key_template: Option<String>,
    /// Disabled jobs never fire on schedule but can still be triggered manually.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl JobConfig {
    /// Creates an enabled job.
    #[must_use]
    pub fn new(name: impl Into<String>, time_of_day: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_of_day: time_of_day.into(),
            timezone: timezone.into(),
            run_key_template: None,
            enabled: true,
        }
    }

    /// Sets the run key template.
    #[must_use]
    pub fn with_run_key_template(mut self, template: impl Into<String>) -> Self {
        self.run_key_template = Some(template.into());
        self
    }

    /// Marks the job disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parses the fire time.
    pub fn parse_time_of_day(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.time_of_day, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&self.time_of_day, "%H:%M"))
            .map_err(|_| ConfigError::InvalidTimeOfDay {
                job: self.name.clone(),
                value: self.time_of_day.clone(),
            })
    }

    /// Parses the timezone.
    pub fn parse_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|_| ConfigError::UnknownTimezone {
            job: self.name.clone(),
            value: self.timezone.clone(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("jobs.name", "must not be empty"));
        }
        self.parse_time_of_day()?;
        self.parse_timezone()?;
        Ok(())
    }
}

/// Configuration for the scheduler tick loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Where last-fired dates are persisted across restarts, if anywhere.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_tick_interval_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            state_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = crate::utils::duration_ms(interval);
        self
    }

    /// Sets where last-fired dates are persisted.
    #[must_use]
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Gets the tick interval as a Duration.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Configuration for the run coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Default per-stage timeout; stages may override it.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// How long a cancelled stage may take to wind down, and how long
    /// shutdown waits for in-flight runs.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl CoordinatorConfig {
    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = crate::utils::duration_ms(timeout);
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = crate::utils::duration_ms(grace);
        self
    }

    /// Gets the default stage timeout as a Duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Gets the shutdown grace period as a Duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Event bus settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Provider call budgets.
    #[serde(default)]
    pub providers: Vec<ProviderQuotaConfig>,
    /// Recurring jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Coordinator settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Where quota counters are persisted across restarts, if anywhere.
    #[serde(default)]
    pub quota_state_path: Option<PathBuf>,
}

impl SystemConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ScanflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScanflowError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Adds a provider budget.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderQuotaConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Adds a job.
    #[must_use]
    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.jobs.push(job);
        self
    }

    /// Replaces the bus settings.
    #[must_use]
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Replaces the scheduler settings.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the coordinator settings.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Sets where quota counters are persisted.
    #[must_use]
    pub fn with_quota_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.quota_state_path = Some(path.into());
        self
    }

    /// Checks the configuration for values the system cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::invalid("bus.queue_capacity", "must be positive"));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("scheduler.tick_interval_ms", "must be positive"));
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !providers.insert(provider.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "provider",
                    name: provider.name.clone(),
                });
            }
        }

        let mut jobs = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !jobs.insert(job.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "job",
                    name: job.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SystemConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.bus.queue_capacity, 1000);
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_full_document() {
        let config = SystemConfig::from_json_str(
            r#"{
                "bus": {"queue_capacity": 8, "publish_timeout_ms": 50},
                "providers": [
                    {"name": "primary", "limit": 0},
                    {"name": "secondary", "limit": 500, "window_seconds": 60, "warn_threshold_ratio": 0.8}
                ],
                "jobs": [
                    {"name": "premarket", "time_of_day": "09:00", "timezone": "Europe/Berlin"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.bus.queue_capacity, 8);
        assert_eq!(config.bus.publish_timeout(), Duration::from_millis(50));
        assert_eq!(config.providers[0].window_seconds, 86_400);
        assert_eq!(config.providers[1].window(), Duration::from_secs(60));
        assert_eq!(
            config.jobs[0].parse_time_of_day().unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap()
        );
        assert_eq!(config.jobs[0].parse_timezone().unwrap(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = SystemConfig::from_json_str(r#"{"bus": {"queue_capacity": 0}}"#).unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_rejects_bad_warn_ratio() {
        let config = SystemConfig::default().with_provider(ProviderQuotaConfig::new("p", 10).with_warn_ratio(1.5));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_oversized_quota_window() {
        let huge = Duration::from_secs(9_000_000_000_000_000);
        let config = SystemConfig::default().with_provider(ProviderQuotaConfig::new("p", 10).with_window(huge));
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "providers.p.window_seconds"),
            other => panic!("expected invalid window, got {other:?}"),
        }

        let year = Duration::from_secs(MAX_QUOTA_WINDOW_SECONDS);
        let config = SystemConfig::default().with_provider(ProviderQuotaConfig::new("p", 10).with_window(year));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        let config = SystemConfig::default().with_job(JobConfig::new("daily", "09:00", "Mars/Olympus"));
        assert!(matches!(config.validate(), Err(ConfigError::UnknownTimezone { .. })));
    }

    #[test]
    fn test_rejects_bad_time_of_day() {
        let config = SystemConfig::default().with_job(JobConfig::new("daily", "25:99", "UTC"));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeOfDay { .. })));
    }

    #[test]
    fn test_rejects_duplicate_jobs() {
        let config = SystemConfig::default()
            .with_job(JobConfig::new("daily", "09:00", "UTC"))
            .with_job(JobConfig::new("daily", "10:00", "UTC"));
        assert!(matches!(config.validate(), Err(ConfigError::Duplicate { kind: "job", .. })));
    }

    #[test]
    fn test_time_of_day_with_seconds() {
        let job = JobConfig::new("close", "15:30:15", "America/New_York");
        assert_eq!(
            job.parse_time_of_day().unwrap(),
            NaiveTime::from_hms_opt(15, 30, 15).unwrap()
        );
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scheduler": {{"tick_interval_ms": 15000}}}}"#).unwrap();

        let config = SystemConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 15_000);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SystemConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.code(), "io");
    }
}
