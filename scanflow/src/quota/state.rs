//! Fixed-window counter for one provider.

use crate::config::{ProviderQuotaConfig, MAX_QUOTA_WINDOW_SECONDS};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Call budget state for one provider.
///
/// Only [`super::QuotaGuard`] mutates a window, always under the provider's
/// own lock. Exhaustion is derived from `calls` and `limit`, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWindow {
    window_start: DateTime<Utc>,
    window: Duration,
    calls: u64,
    limit: u64,
    warn_ratio: f64,
    warned: bool,
}

impl QuotaWindow {
    /// Opens a fresh window at `now`.
    #[must_use]
    pub fn new(config: &ProviderQuotaConfig, now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            window: window_length(config),
            calls: 0,
            limit: config.limit,
            warn_ratio: config.warn_threshold_ratio,
            warned: false,
        }
    }

    /// Applies new limits while keeping the current count.
    pub fn reconfigure(&mut self, config: &ProviderQuotaConfig) {
        self.window = window_length(config);
        self.limit = config.limit;
        self.warn_ratio = config.warn_threshold_ratio;
        self.warned = self.warned && self.is_near_limit();
    }

    /// Advances the window by whole periods until it contains `now`.
    ///
    /// Returns the number of periods skipped; zero if the window is current.
    /// A clock that moved backwards leaves the window untouched.
    pub fn roll_forward(&mut self, now: DateTime<Utc>) -> i64 {
        if now < self.window_end() {
            return 0;
        }
        let window_ms = self.window.num_milliseconds().max(1);
        let periods = (now - self.window_start).num_milliseconds() / window_ms;
        self.window_start = Duration::try_milliseconds(periods.saturating_mul(window_ms))
            .and_then(|skipped| self.window_start.checked_add_signed(skipped))
            .unwrap_or(now);
        self.calls = 0;
        self.warned = false;
        periods
    }

    /// Resets the count and starts a new window at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.window_start = now;
        self.calls = 0;
        self.warned = false;
    }

    /// Tries to record `count` calls.
    ///
    /// Returns `None` without changing anything if the calls would exceed the
    /// limit, otherwise whether this increment crossed the warning threshold
    /// for the first time in the window.
    pub fn try_record(&mut self, count: u64) -> Option<bool> {
        let next = self.calls.checked_add(count)?;
        if next > self.limit {
            return None;
        }
        self.calls = next;
        let crossed = !self.warned && self.is_near_limit();
        if crossed {
            self.warned = true;
        }
        Some(crossed)
    }

    /// Calls recorded in the current window.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Calls allowed per window.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Start of the current window.
    #[must_use]
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// End of the current window.
    #[must_use]
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True while another call fits in the window.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.calls < self.limit
    }

    /// `calls / limit`, or 1.0 for a zero limit.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            1.0
        } else {
            self.calls as f64 / self.limit as f64
        }
    }

    /// True once usage reaches the warning threshold.
    #[must_use]
    pub fn is_near_limit(&self) -> bool {
        self.usage_ratio() >= self.warn_ratio
    }

    pub(crate) fn restore(&mut self, persisted: &PersistedWindow, now: DateTime<Utc>) {
        self.window_start = persisted.window_start;
        self.calls = persisted.calls.min(self.limit);
        self.warned = persisted.warned;
        self.roll_forward(now);
    }

    pub(crate) fn persist(&self) -> PersistedWindow {
        PersistedWindow {
            window_start: self.window_start,
            calls: self.calls,
            warned: self.warned,
        }
    }

    /// Read-only view for callers.
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> QuotaSnapshot {
        QuotaSnapshot {
            provider: provider.to_string(),
            used: self.calls,
            limit: self.limit,
            remaining: self.limit.saturating_sub(self.calls),
            usage_percent: (self.usage_ratio() * 10_000.0).round() / 100.0,
            warn_threshold_ratio: self.warn_ratio,
            window_start: self.window_start,
            window_end: self.window_end(),
            available: self.is_available(),
            near_limit: self.is_near_limit(),
        }
    }
}

fn window_length(config: &ProviderQuotaConfig) -> Duration {
    let seconds = config.window_seconds.min(MAX_QUOTA_WINDOW_SECONDS);
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .filter(|d| *d > Duration::zero())
        .unwrap_or_else(|| Duration::days(1))
}

/// Read-only view of a provider's quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Provider name.
    pub provider: String,
    /// Calls recorded in the current window.
    pub used: u64,
    /// Calls allowed per window.
    pub limit: u64,
    /// Calls left in the current window.
    pub remaining: u64,
    /// Usage as a percentage, two decimals.
    pub usage_percent: f64,
    /// Ratio at which the provider counts as near its limit.
    pub warn_threshold_ratio: f64,
    /// Start of the current window.
    pub window_start: DateTime<Utc>,
    /// End of the current window.
    pub window_end: DateTime<Utc>,
    /// Whether another call fits.
    pub available: bool,
    /// Whether usage reached the warning threshold.
    pub near_limit: bool,
}

/// On-disk form of one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedWindow {
    pub(crate) window_start: DateTime<Utc>,
    pub(crate) calls: u64,
    #[serde(default)]
    pub(crate) warned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
    }

    fn minute_window(limit: u64) -> QuotaWindow {
        let config = ProviderQuotaConfig::new("p", limit)
            .with_window(std::time::Duration::from_secs(60))
            .with_warn_ratio(0.5);
        QuotaWindow::new(&config, start())
    }

    #[test]
    fn test_records_up_to_limit() {
        let mut window = minute_window(2);
        assert_eq!(window.try_record(1), Some(true));
        assert_eq!(window.try_record(1), Some(false));
        assert!(!window.is_available());
        assert_eq!(window.try_record(1), None);
        assert_eq!(window.calls(), 2);
    }

    #[test]
    fn test_roll_forward_catches_up_whole_periods() {
        let mut window = minute_window(5);
        window.try_record(3);

        let later = start() + Duration::seconds(5 * 60 + 30);
        assert_eq!(window.roll_forward(later), 5);
        assert_eq!(window.window_start(), start() + Duration::seconds(300));
        assert_eq!(window.window_end(), start() + Duration::seconds(360));
        assert_eq!(window.calls(), 0);
    }

    #[test]
    fn test_roll_forward_inside_window_is_noop() {
        let mut window = minute_window(5);
        window.try_record(1);
        assert_eq!(window.roll_forward(start() + Duration::seconds(59)), 0);
        assert_eq!(window.calls(), 1);
    }

    #[test]
    fn test_backwards_clock_leaves_window() {
        let mut window = minute_window(5);
        window.try_record(1);
        assert_eq!(window.roll_forward(start() - Duration::hours(1)), 0);
        assert_eq!(window.window_start(), start());
    }

    #[test]
    fn test_zero_limit_is_exhausted_and_near_limit() {
        let window = minute_window(0);
        assert!(!window.is_available());
        assert!(window.is_near_limit());
        assert_eq!(window.snapshot("p").usage_percent, 100.0);
    }

    #[test]
    fn test_snapshot_fields() {
        let mut window = minute_window(4);
        window.try_record(1);
        let snapshot = window.snapshot("primary");

        assert_eq!(snapshot.provider, "primary");
        assert_eq!(snapshot.remaining, 3);
        assert_eq!(snapshot.usage_percent, 25.0);
        assert!(snapshot.available);
        assert!(!snapshot.near_limit);
    }

    #[test]
    fn test_oversized_window_is_capped() {
        let config = ProviderQuotaConfig::new("p", 1)
            .with_window(std::time::Duration::from_secs(9_000_000_000_000_000));
        let mut window = QuotaWindow::new(&config, start());

        let cap = i64::try_from(MAX_QUOTA_WINDOW_SECONDS).unwrap();
        assert_eq!(window.window_end(), start() + Duration::seconds(cap));
        assert!(window.is_available());
        assert_eq!(window.roll_forward(start() + Duration::days(1)), 0);
    }

    #[test]
    fn test_window_end_saturates_near_max_time() {
        let mut window = minute_window(1);
        window.reset(DateTime::<Utc>::MAX_UTC - Duration::seconds(1));
        assert_eq!(window.window_end(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(window.roll_forward(DateTime::<Utc>::MAX_UTC), 0);
    }
}
