//! Per-provider call budgets and provider selection.

use super::state::{PersistedWindow, QuotaSnapshot, QuotaWindow};
use crate::config::ProviderQuotaConfig;
use crate::errors::ScanflowError;
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a successful [`QuotaGuard::record_call`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    /// The provider has no configured budget; nothing was counted.
    Untracked,
    /// The call was counted.
    Tracked {
        /// State after the call.
        snapshot: QuotaSnapshot,
        /// True if this call crossed the warning threshold for the first
        /// time in the current window.
        crossed_warning: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct QuotaStateFile {
    saved_at: DateTime<Utc>,
    providers: BTreeMap<String, PersistedWindow>,
}

/// Tracks fixed-window call budgets for named providers.
///
/// Each provider's window sits behind its own lock, so stages working
/// against different providers never contend. Providers without a budget are
/// untracked: always available and never counted.
pub struct QuotaGuard {
    clock: Arc<dyn Clock>,
    providers: DashMap<String, Arc<Mutex<QuotaWindow>>>,
}

impl QuotaGuard {
    /// Creates a guard with no providers.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            providers: DashMap::new(),
        }
    }

    /// Creates a guard with the given budgets.
    #[must_use]
    pub fn with_providers(configs: &[ProviderQuotaConfig], clock: Arc<dyn Clock>) -> Self {
        let guard = Self::new(clock);
        for config in configs {
            guard.register_provider(config);
        }
        guard
    }

    /// Adds a provider, or updates the limits of a known one while keeping
    /// its current count.
    pub fn register_provider(&self, config: &ProviderQuotaConfig) {
        if let Some(existing) = self.window(&config.name) {
            existing.lock().reconfigure(config);
            debug!(provider = %config.name, limit = config.limit, "Quota reconfigured");
            return;
        }
        let window = QuotaWindow::new(config, self.clock.now());
        self.providers
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(window)));
        debug!(
            provider = %config.name,
            limit = config.limit,
            window_seconds = config.window_seconds,
            "Quota registered"
        );
    }

    /// Returns whether the provider has a budget.
    #[must_use]
    pub fn is_tracked(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Records one call against the provider's current window.
    pub fn record_call(&self, provider: &str) -> Result<RecordedCall, ScanflowError> {
        self.record_calls(provider, 1)
    }

    /// Records `count` calls against the provider's current window.
    ///
    /// Fails with [`ScanflowError::QuotaExhausted`] without counting anything
    /// if the calls do not fit.
    pub fn record_calls(&self, provider: &str, count: u64) -> Result<RecordedCall, ScanflowError> {
        let Some(window) = self.window(provider) else {
            debug!(provider, "Call to untracked provider");
            return Ok(RecordedCall::Untracked);
        };
        let now = self.clock.now();
        let mut window = window.lock();
        roll(&mut window, provider, now);

        match window.try_record(count) {
            Some(crossed_warning) => {
                let snapshot = window.snapshot(provider);
                if crossed_warning {
                    warn!(
                        provider,
                        used = snapshot.used,
                        limit = snapshot.limit,
                        usage_percent = snapshot.usage_percent,
                        "Quota warning threshold reached"
                    );
                }
                Ok(RecordedCall::Tracked {
                    snapshot,
                    crossed_warning,
                })
            }
            None => Err(ScanflowError::QuotaExhausted {
                provider: provider.to_string(),
                limit: window.limit(),
                window_end: window.window_end(),
            }),
        }
    }

    /// True iff another call fits in the provider's current window.
    #[must_use]
    pub fn is_available(&self, provider: &str) -> bool {
        self.with_current(provider, QuotaWindow::is_available).unwrap_or(true)
    }

    /// True iff usage reached the provider's warning threshold.
    #[must_use]
    pub fn is_near_limit(&self, provider: &str) -> bool {
        self.with_current(provider, QuotaWindow::is_near_limit).unwrap_or(false)
    }

    /// Returns the first available provider in caller priority order.
    pub fn select_provider<S: AsRef<str>>(&self, candidates: &[S]) -> Option<String> {
        candidates
            .iter()
            .map(AsRef::as_ref)
            .find(|name| self.is_available(name))
            .map(ToString::to_string)
    }

    /// Read-only view of one provider.
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> Option<QuotaSnapshot> {
        self.with_current(provider, |w| w.snapshot(provider))
    }

    /// Read-only view of every tracked provider, ordered by name.
    #[must_use]
    pub fn status(&self) -> Vec<QuotaSnapshot> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().filter_map(|name| self.snapshot(name)).collect()
    }

    /// Starts a fresh window for every provider.
    pub fn reset_all(&self) {
        let now = self.clock.now();
        for entry in &self.providers {
            entry.value().lock().reset(now);
        }
        info!(providers = self.providers.len(), "All quotas reset");
    }

    /// Writes the current windows to `path` as JSON.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<(), ScanflowError> {
        let providers = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().persist()))
            .collect();
        let file = QuotaStateFile {
            saved_at: self.clock.now(),
            providers,
        };
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(&file)?)?;
        debug!(path = %path.as_ref().display(), "Quota state saved");
        Ok(())
    }

    /// Restores windows saved by [`QuotaGuard::save_state`].
    ///
    /// Limits stay as configured; only counts and window starts are taken
    /// from the file, then rolled forward to now. Entries for unregistered
    /// providers are ignored. Returns the number of providers restored.
    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<usize, ScanflowError> {
        let raw = std::fs::read(path.as_ref())?;
        let file: QuotaStateFile = serde_json::from_slice(&raw)?;
        let now = self.clock.now();

        let mut restored = 0;
        for (name, persisted) in &file.providers {
            match self.window(name) {
                Some(window) => {
                    window.lock().restore(persisted, now);
                    restored += 1;
                }
                None => debug!(provider = %name, "Ignoring saved quota for unknown provider"),
            }
        }
        info!(path = %path.as_ref().display(), restored, saved_at = %file.saved_at, "Quota state loaded");
        Ok(restored)
    }

    fn window(&self, provider: &str) -> Option<Arc<Mutex<QuotaWindow>>> {
        self.providers.get(provider).map(|entry| Arc::clone(entry.value()))
    }

    fn with_current<T>(&self, provider: &str, f: impl FnOnce(&QuotaWindow) -> T) -> Option<T> {
        let window = self.window(provider)?;
        let mut window = window.lock();
        roll(&mut window, provider, self.clock.now());
        Some(f(&window))
    }
}

fn roll(window: &mut QuotaWindow, provider: &str, now: DateTime<Utc>) {
    let periods = window.roll_forward(now);
    if periods > 0 {
        info!(provider, periods, window_start = %window.window_start(), "Quota window rolled over");
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("providers", &self.providers.len())
            .finish_non_exhaustive()
    }
}
