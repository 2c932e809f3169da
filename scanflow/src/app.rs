//! Shared handles wired together once at startup.

use crate::cancellation::CancellationToken;
use crate::config::SystemConfig;
use crate::coordinator::RunRegistry;
use crate::errors::ScanflowError;
use crate::events::EventBus;
use crate::quota::QuotaGuard;
use crate::stages::ProviderRegistry;
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;

/// Everything the scheduler and coordinator share.
///
/// Built from a validated [`SystemConfig`] and passed to each component's
/// constructor. Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct ApplicationContext {
    /// Validated configuration.
    pub config: Arc<SystemConfig>,
    /// The event bus.
    pub bus: Arc<EventBus>,
    /// Provider call budgets.
    pub quota: Arc<QuotaGuard>,
    /// Provider implementations.
    pub providers: Arc<ProviderRegistry>,
    /// Reserved and executing run keys.
    pub runs: Arc<RunRegistry>,
    /// Root cancellation token; cancelling it stops every component.
    pub cancellation: Arc<CancellationToken>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl ApplicationContext {
    /// Builds a context on the system clock.
    pub fn new(config: SystemConfig) -> Result<Self, ScanflowError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a context on the given clock.
    pub fn with_clock(config: SystemConfig, clock: Arc<dyn Clock>) -> Result<Self, ScanflowError> {
        config.validate()?;
        let quota = QuotaGuard::with_providers(&config.providers, Arc::clone(&clock));
        Ok(Self {
            bus: EventBus::new(config.bus.clone()),
            quota: Arc::new(quota),
            providers: Arc::new(ProviderRegistry::new()),
            runs: Arc::new(RunRegistry::new()),
            cancellation: Arc::new(CancellationToken::new()),
            clock,
            config: Arc::new(config),
        })
    }
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("providers", &self.providers)
            .field("runs", &self.runs.len())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, ProviderQuotaConfig};
    use crate::errors::ConfigError;

    #[test]
    fn test_context_registers_quota() {
        let config = SystemConfig::default().with_provider(ProviderQuotaConfig::new("primary", 10));
        let ctx = ApplicationContext::new(config).unwrap();

        assert!(ctx.quota.is_tracked("primary"));
        assert!(ctx.bus.is_accepting());
        assert!(ctx.runs.is_empty());
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let config = SystemConfig::default().with_bus(BusConfig::default().with_queue_capacity(0));
        let err = ApplicationContext::new(config).unwrap_err();
        assert!(matches!(err, ScanflowError::Config(ConfigError::Invalid { .. })));
    }
}
