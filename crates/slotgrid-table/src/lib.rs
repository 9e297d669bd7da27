//! SlotGrid Slot Table
//!
//! The authoritative, in-memory occupancy table for a fixed pool of slots.
//!
//! # Model
//!
//! Every slot is either FREE or HELD by exactly one claimant. Slots are created
//! when the table is built and never added, removed or renamed afterwards. The
//! only mutation is a FREE→HELD transition through [`SlotTable::try_claim`].
//!
//! # Exclusion
//!
//! Each slot carries its own guard. Claims on the same slot serialize on that
//! guard and the first one to observe FREE wins; claims on different slots
//! never touch the same lock. Reads go through [`SlotTable::snapshot`], which
//! returns a point-in-time copy of the whole table without taking any lock
//! for longer than a single slot read.
//!
//! # Example
//!
//! ```
//! use slotgrid_table::{ClaimOutcome, SlotTable};
//!
//! let table = SlotTable::grid(5, 5).unwrap();
//! assert!(table.try_claim("ticket_0_0", "A").unwrap().is_accepted());
//! assert!(matches!(
//!     table.try_claim("ticket_0_0", "B").unwrap(),
//!     ClaimOutcome::Rejected { .. }
//! ));
//! assert!(table.snapshot().is_occupied("ticket_0_0"));
//! ```

mod error;
mod id;
mod slot;
mod snapshot;
mod table;

pub use error::{Result, TableError};
pub use id::{grid_slot_id, ClaimantId, SlotId};
pub use slot::{ClaimOutcome, Slot};
pub use snapshot::Snapshot;
pub use table::SlotTable;
