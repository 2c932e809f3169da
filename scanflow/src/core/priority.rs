//! Event priority tiers and the run key newtype.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery priority of an event.
///
/// Ordered so that `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Diagnostics and other best-effort traffic.
    Low,
    /// Regular lifecycle traffic.
    #[default]
    Normal,
    /// Traffic that should overtake normal lifecycle events.
    High,
    /// Run triggers and other time-sensitive traffic.
    Critical,
}

impl EventPriority {
    /// Number of priority tiers.
    pub const TIERS: usize = 4;

    /// All priorities, highest first. This is the dispatch drain order.
    pub const DESCENDING: [Self; Self::TIERS] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Index of this priority's queue in drain order (0 = drained first).
    #[must_use]
    pub const fn tier(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Correlates every event and result belonging to one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    /// Creates a run key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }

    #[test]
    fn test_tiers_follow_descending_order() {
        for (index, priority) in EventPriority::DESCENDING.iter().enumerate() {
            assert_eq!(priority.tier(), index);
        }
    }

    #[test]
    fn test_run_key_serializes_as_string() {
        let key = RunKey::new("primary:2026-03-29");
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""primary:2026-03-29""#);
        assert_eq!(key.to_string(), "primary:2026-03-29");
    }
}
