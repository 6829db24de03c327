//! Relay state table: one slot per configured actuator.

use std::collections::BTreeMap;

use super::RelayState;
use crate::snapshot::{RelayActuator, RelayId};

/// Runtime state of one actuator.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySlot {
    pub actuator: RelayActuator,
    pub state: RelayState,
    /// Single pending auto-off.  Replaced, never stacked.
    pub deadline_ms: Option<u64>,
    /// Requested duration of the current on-interval (0 = indefinite).
    pub requested_ms: u64,
    pub on_since_ms: Option<u64>,
    /// `None` = off since before the core started.
    pub off_since_ms: Option<u64>,
}

impl RelaySlot {
    /// A freshly registered actuator.  `Unknown` until the first write.
    pub fn new(actuator: RelayActuator) -> Self {
        Self {
            actuator,
            state: RelayState::Unknown,
            deadline_ms: None,
            requested_ms: 0,
            on_since_ms: None,
            off_since_ms: None,
        }
    }

    pub fn draw_amps(&self) -> f32 {
        if self.state.draws_current() {
            self.actuator.amps
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStateTable {
    slots: BTreeMap<RelayId, RelaySlot>,
}

impl RelayStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: RelaySlot) -> Option<RelaySlot> {
        self.slots.insert(slot.actuator.id, slot)
    }

    pub fn remove(&mut self, id: RelayId) -> Option<RelaySlot> {
        self.slots.remove(&id)
    }

    pub fn get(&self, id: RelayId) -> Option<&RelaySlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: RelayId) -> Option<&mut RelaySlot> {
        self.slots.get_mut(&id)
    }

    pub fn state(&self, id: RelayId) -> Option<RelayState> {
        self.slots.get(&id).map(|s| s.state)
    }

    pub fn contains(&self, id: RelayId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<RelayId> {
        self.slots.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelaySlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total rated draw of every actuator that is (or may be) energised,
    /// optionally leaving one relay out.
    pub fn load_amps(&self, except: Option<RelayId>) -> f32 {
        self.slots
            .values()
            .filter(|s| Some(s.actuator.id) != except)
            .map(RelaySlot::draw_amps)
            .sum()
    }

    /// Earliest pending auto-off.
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.values().filter_map(|s| s.deadline_ms).min()
    }

    /// Relays whose deadline has passed, earliest first.
    pub fn due(&self, now_ms: u64) -> Vec<RelayId> {
        let mut due: Vec<(u64, RelayId)> = self
            .slots
            .values()
            .filter_map(|s| s.deadline_ms.filter(|d| *d <= now_ms).map(|d| (d, s.actuator.id)))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, id)| id).collect()
    }
}
