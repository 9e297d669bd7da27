//! Slot view and claim outcome.

use crate::{ClaimantId, SlotId};

/// A read-only view of one slot.
///
/// `holder` is present iff the slot is occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub holder: Option<ClaimantId>,
}

impl Slot {
    /// Whether the slot is HELD.
    pub fn is_occupied(&self) -> bool {
        self.holder.is_some()
    }
}

/// Result of a claim attempt on an existing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The slot went FREE→HELD. `version` is the table version after the claim.
    Accepted { version: u64 },
    /// The slot was already HELD; nothing changed.
    Rejected { holder: ClaimantId },
}

impl ClaimOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ClaimOutcome::Accepted { .. })
    }
}
