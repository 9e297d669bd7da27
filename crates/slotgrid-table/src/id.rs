//! Slot and claimant identifiers.

use std::borrow::Borrow;
use std::fmt;

/// Stable identifier of a slot, unique within its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SlotId(String);

impl SlotId {
    /// Create a slot id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SlotId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for SlotId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identity string of whoever holds (or tries to claim) a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ClaimantId(String);

impl ClaimantId {
    /// Create a claimant id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClaimantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Id of the grid slot at `(row, col)`.
pub fn grid_slot_id(row: usize, col: usize) -> SlotId {
    SlotId(format!("ticket_{}_{}", row, col))
}
