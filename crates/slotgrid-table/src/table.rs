//! The slot table.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::{grid_slot_id, ClaimOutcome, ClaimantId, Result, Slot, SlotId, Snapshot, TableError};

/// One slot and its exclusion guard.
#[derive(Debug)]
struct SlotCell {
    id: SlotId,
    holder: Mutex<Option<ClaimantId>>,
}

impl SlotCell {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            holder: Mutex::new(None),
        }
    }

    /// Acquire this slot's guard.
    ///
    /// The critical sections never leave a half-written holder, so a poisoned
    /// guard still protects valid data.
    fn lock(&self) -> MutexGuard<'_, Option<ClaimantId>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size table of slots with one exclusion guard per slot.
///
/// The id→slot index is built once and never modified, so lookups are
/// lock-free; only the addressed slot's guard is taken on a claim.
#[derive(Debug)]
pub struct SlotTable {
    cells: Vec<SlotCell>,
    index: HashMap<SlotId, usize>,
    /// Number of accepted claims. Bumped while the claimed slot's guard is held.
    version: AtomicU64,
}

impl SlotTable {
    /// Build a `rows`×`cols` grid of FREE slots named `ticket_{row}_{col}`.
    pub fn grid(rows: usize, cols: usize) -> Result<Self> {
        let ids = (0..rows).flat_map(|row| (0..cols).map(move |col| grid_slot_id(row, col)));
        Self::from_ids(ids)
    }

    /// Build a table of FREE slots from an explicit id list, keeping its order.
    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<SlotId>,
    {
        let mut cells = Vec::new();
        let mut index = HashMap::new();

        for id in ids {
            let id = id.into();
            if index.contains_key(&id) {
                return Err(TableError::DuplicateSlot(id));
            }
            index.insert(id.clone(), cells.len());
            cells.push(SlotCell::new(id));
        }

        if cells.is_empty() {
            return Err(TableError::Empty);
        }

        Ok(Self {
            cells,
            index,
            version: AtomicU64::new(0),
        })
    }

    fn cell(&self, id: &str) -> Result<&SlotCell> {
        self.index
            .get(id)
            .map(|&i| &self.cells[i])
            .ok_or_else(|| TableError::UnknownSlot(SlotId::from(id)))
    }

    /// Try to move a slot from FREE to HELD by `claimant`.
    ///
    /// Exactly one of any number of concurrent claims on the same slot is
    /// accepted. A claim on a HELD slot is rejected even when the claimant
    /// already holds it. Unknown ids fail without side effects.
    pub fn try_claim(&self, id: &str, claimant: impl Into<ClaimantId>) -> Result<ClaimOutcome> {
        let cell = self.cell(id)?;
        let mut holder = cell.lock();

        if let Some(existing) = holder.as_ref() {
            return Ok(ClaimOutcome::Rejected {
                holder: existing.clone(),
            });
        }

        *holder = Some(claimant.into());
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ClaimOutcome::Accepted { version })
    }

    /// Point-in-time copy of every slot.
    ///
    /// The slot reads are bracketed by two version loads and retried when a
    /// claim lands in between. Slots only ever go FREE→HELD, so this retries
    /// at most once per slot over the table's whole lifetime.
    pub fn snapshot(&self) -> Snapshot {
        loop {
            let before = self.version.load(Ordering::SeqCst);
            let slots: BTreeMap<SlotId, Option<ClaimantId>> = self
                .cells
                .iter()
                .map(|cell| (cell.id.clone(), cell.lock().clone()))
                .collect();
            let after = self.version.load(Ordering::SeqCst);

            if before == after {
                return Snapshot::new(before, slots);
            }
            trace!("snapshot raced with a claim ({} -> {}), retrying", before, after);
        }
    }

    /// Current state of one slot.
    pub fn get(&self, id: &str) -> Result<Slot> {
        let cell = self.cell(id)?;
        let holder = cell.lock().clone();
        Ok(Slot {
            id: cell.id.clone(),
            holder,
        })
    }

    /// Whether the table has a slot with this id.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Slot ids in construction order.
    pub fn ids(&self) -> impl Iterator<Item = &SlotId> {
        self.cells.iter().map(|cell| &cell.id)
    }

    /// Number of slots (fixed for the table's lifetime).
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false; empty tables cannot be built.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of accepted claims so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
