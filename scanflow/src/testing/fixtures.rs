//! Test fixtures: fast configurations and fixed instants.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::app::ApplicationContext;
use crate::config::{BusConfig, CoordinatorConfig, ProviderQuotaConfig, SchedulerConfig, SystemConfig};
use crate::events::CollectingEventSink;
use crate::utils::ManualClock;

/// A configuration with short timeouts suitable for tests.
#[must_use]
pub fn fast_config() -> SystemConfig {
    SystemConfig::default()
        .with_bus(
            BusConfig::default()
                .with_publish_timeout(Duration::from_millis(100))
                .with_handler_timeout(Duration::from_secs(1))
                .with_drain_timeout(Duration::from_secs(1)),
        )
        .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_millis(20)))
        .with_coordinator(
            CoordinatorConfig::default()
                .with_stage_timeout(Duration::from_secs(2))
                .with_shutdown_grace(Duration::from_millis(200)),
        )
}

/// Builds a UTC instant. Panics on an invalid date.
#[must_use]
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid instant {year}-{month}-{day} {hour}:{minute}"))
}

/// A started context with a collecting sink and a manual clock.
#[derive(Debug)]
pub struct TestHarness {
    /// Shared handles.
    pub context: ApplicationContext,
    /// Every event published on the bus.
    pub sink: Arc<CollectingEventSink>,
    /// Clock driving quota windows and scheduler ticks.
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    /// Builds a harness from `config`, starting the clock at `now`.
    #[must_use]
    pub fn new(config: SystemConfig, now: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let context = ApplicationContext::with_clock(config, clock.clone())
            .unwrap_or_else(|err| panic!("invalid test configuration: {err}"));
        let sink = Arc::new(CollectingEventSink::new());
        context.bus.attach_sink(sink.clone());
        context.bus.start();
        Self { context, sink, clock }
    }

    /// Builds a harness over [`fast_config`] with the given provider limits.
    #[must_use]
    pub fn with_providers(providers: &[(&str, u64)]) -> Self {
        let config = providers.iter().fold(fast_config(), |config, (name, limit)| {
            config.with_provider(ProviderQuotaConfig::new(*name, *limit))
        });
        Self::new(config, Utc::now())
    }
}
