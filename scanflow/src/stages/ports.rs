//! Provider ports - the upstream services stages call through.
//!
//! Stages never talk to a provider directly. The coordinator hands them a
//! [`ProviderHandle`] for the provider it selected, and every call made
//! through the handle is metered by the quota guard.

use crate::core::{Event, EventPayload, RunKey};
use crate::errors::ProviderError;
use crate::events::EventBus;
use crate::quota::{QuotaGuard, QuotaSnapshot, RecordedCall};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// An upstream data provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, matching its quota configuration.
    fn name(&self) -> &str;

    /// Performs one call.
    async fn invoke(&self, request: Value) -> Result<Value, ProviderError>;
}

/// Provider implementations by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a provider under its own name.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        debug!(provider = provider.name(), "Provider registered");
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Looks up a provider.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|p| Arc::clone(p.value()))
    }

    /// Returns registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// The provider selected for one stage attempt.
#[derive(Clone)]
pub struct ProviderHandle {
    name: String,
    provider: Option<Arc<dyn Provider>>,
    quota: Arc<QuotaGuard>,
    bus: Arc<EventBus>,
    run_key: RunKey,
}

impl ProviderHandle {
    /// Creates a handle. `provider` may be absent when the stage talks to the
    /// upstream itself and only needs metering.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Option<Arc<dyn Provider>>,
        quota: Arc<QuotaGuard>,
        bus: Arc<EventBus>,
        run_key: RunKey,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            quota,
            bus,
            run_key,
        }
    }

    /// Name of the selected provider.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counts one call against the provider's quota.
    ///
    /// An exhausted quota is reported as [`ProviderError::Exhausted`] so the
    /// coordinator moves on to the next candidate.
    pub fn record_call(&self) -> Result<(), ProviderError> {
        match self.quota.record_call(&self.name) {
            Ok(RecordedCall::Tracked {
                snapshot,
                crossed_warning: true,
            }) => {
                self.publish_warning(snapshot);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(ProviderError::Exhausted(err.to_string())),
        }
    }

    /// Meters and performs one call against the provider.
    pub async fn invoke(&self, request: Value) -> Result<Value, ProviderError> {
        let Some(provider) = &self.provider else {
            return Err(ProviderError::permanent(format!(
                "no implementation registered for provider '{}'",
                self.name
            )));
        };
        self.record_call()?;
        provider.invoke(request).await
    }

    fn publish_warning(&self, snapshot: QuotaSnapshot) {
        let event = Event::new(EventPayload::QuotaWarning {
            provider: snapshot.provider,
            used: snapshot.used,
            limit: snapshot.limit,
            usage_ratio: snapshot.usage_percent / 100.0,
            window_end: snapshot.window_end,
        })
        .for_run(self.run_key.clone());
        if let Err(err) = self.bus.try_publish(event) {
            warn!(provider = %self.name, error = %err, "Could not publish quota warning");
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.name)
            .field("has_implementation", &self.provider.is_some())
            .field("run_key", &self.run_key)
            .finish()
    }
}
