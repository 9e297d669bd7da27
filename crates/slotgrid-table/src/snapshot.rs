//! Point-in-time copies of the slot table.

use std::collections::BTreeMap;

use crate::{ClaimantId, SlotId};

/// A point-in-time copy of every slot in a table.
///
/// Snapshots are full replacements, never deltas: applying any snapshot on
/// top of an older one yields the table state at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    slots: BTreeMap<SlotId, Option<ClaimantId>>,
}

impl Snapshot {
    pub(crate) fn new(version: u64, slots: BTreeMap<SlotId, Option<ClaimantId>>) -> Self {
        Self { version, slots }
    }

    /// Table version this snapshot was taken at (number of accepted claims).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Occupancy of every slot.
    pub fn occupancy(&self) -> BTreeMap<SlotId, bool> {
        self.slots
            .iter()
            .map(|(id, holder)| (id.clone(), holder.is_some()))
            .collect()
    }

    /// Holders of the occupied slots.
    pub fn holders(&self) -> BTreeMap<SlotId, ClaimantId> {
        self.slots
            .iter()
            .filter_map(|(id, holder)| holder.clone().map(|h| (id.clone(), h)))
            .collect()
    }

    /// Holder of a slot, if it exists and is occupied.
    pub fn holder(&self, id: &str) -> Option<&ClaimantId> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Whether the slot exists and is occupied.
    pub fn is_occupied(&self, id: &str) -> bool {
        self.holder(id).is_some()
    }

    /// Number of occupied slots.
    pub fn claimed_count(&self) -> usize {
        self.slots.values().filter(|h| h.is_some()).count()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
