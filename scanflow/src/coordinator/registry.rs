//! Single-flight bookkeeping for run keys.

use crate::core::RunKey;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of a slot in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// A request has been published for the key but not picked up yet.
    Reserved,
    /// The coordinator is executing a run for the key.
    Active,
}

/// Who holds a run key and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSlot {
    /// Request holding the key.
    pub request_id: Uuid,
    /// Current phase.
    pub phase: RunPhase,
    /// When the slot was taken or last changed phase.
    pub since: DateTime<Utc>,
}

/// Tracks which run keys are reserved or executing.
///
/// At most one slot exists per key. Requesters reserve a key before
/// publishing a request so a second trigger can be refused synchronously;
/// the coordinator then claims the reservation with the same request id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    slots: DashMap<RunKey, RunSlot>,
}

impl RunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `key` for `request_id`. Fails if the key is held.
    pub fn reserve(&self, key: &RunKey, request_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(RunSlot {
                    request_id,
                    phase: RunPhase::Reserved,
                    since: now,
                });
                true
            }
        }
    }

    /// Marks `key` active for `request_id`.
    ///
    /// Succeeds on a free key or on a reservation made by the same request;
    /// fails if another request holds the key or it is already active.
    pub fn claim(&self, key: &RunKey, request_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.slots.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(RunSlot {
                    request_id,
                    phase: RunPhase::Active,
                    since: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let held = slot.get_mut();
                if held.request_id == request_id && held.phase == RunPhase::Reserved {
                    held.phase = RunPhase::Active;
                    held.since = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Frees `key` if `request_id` still holds it.
    pub fn release(&self, key: &RunKey, request_id: Uuid) -> bool {
        self.slots
            .remove_if(key, |_, slot| slot.request_id == request_id)
            .is_some()
    }

    /// Frees every reservation that no run has claimed and returns them.
    /// Active slots are left alone.
    pub fn take_reserved(&self) -> Vec<(RunKey, Uuid)> {
        let keys: Vec<RunKey> = self
            .slots
            .iter()
            .filter(|slot| slot.phase == RunPhase::Reserved)
            .map(|slot| slot.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                self.slots
                    .remove_if(&key, |_, slot| slot.phase == RunPhase::Reserved)
            })
            .map(|(key, slot)| (key, slot.request_id))
            .collect()
    }

    /// Returns true if the key is reserved or active.
    #[must_use]
    pub fn is_held(&self, key: &RunKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Returns true if a run is executing for the key.
    #[must_use]
    pub fn is_active(&self, key: &RunKey) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.phase == RunPhase::Active)
    }

    /// Returns the slot for a key.
    #[must_use]
    pub fn slot(&self, key: &RunKey) -> Option<RunSlot> {
        self.slots.get(key).map(|slot| slot.clone())
    }

    /// Returns the keys of executing runs, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<RunKey> {
        let mut keys: Vec<RunKey> = self
            .slots
            .iter()
            .filter(|slot| slot.phase == RunPhase::Active)
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of held keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
