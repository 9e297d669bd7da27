//! Error types for the slot table.

use thiserror::Error;

use crate::SlotId;

/// Result type for slot table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Errors that can occur when building or querying a slot table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// The slot id is not part of the table.
    #[error("unknown slot: {0}")]
    UnknownSlot(SlotId),

    /// The same slot id was listed twice at construction.
    #[error("duplicate slot: {0}")]
    DuplicateSlot(SlotId),

    /// A table must contain at least one slot.
    #[error("slot table must contain at least one slot")]
    Empty,
}
