//! Flow slots and packed dependency words.
//!
//! A tile's last-user record and every dependency edge are packed into a
//! single `u64` so they can be exchanged with one atomic operation. The word
//! carries the task reference (class id, pool slot, slot generation), the
//! flow index within that task, the access mode, and two state bits:
//! `alive` (the named task has not yet retired this record) and
//! `producer_done` (the producer of a read chain has completed, so later
//! readers are satisfied on arrival).
//!
//! Layout, LSB first:
//!
//! ```text
//! bits  0..24  pool slot        24..40  slot generation
//! bits 40..48  class id         48..54  flow index
//! bits 54..57  access mode      57      alive
//! bit  58      producer_done    63      occupied
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::tile::Tile;

/// Fixed upper bound on data flows per task.
pub const MAX_FLOWS: usize = 16;

/// Access mode of one task argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessMode {
    /// The task reads the tile.
    Read = 1,
    /// The task overwrites the tile.
    Write = 2,
    /// The task reads and writes the tile.
    ReadWrite = 3,
    /// The task updates the tile with a commutative write.
    AtomicWrite = 4,
    /// Private per-task scratch space, no dependency tracking.
    Scratch = 5,
    /// A by-value argument copied at insertion, no dependency tracking.
    Value = 6,
}

impl AccessMode {
    /// Whether this mode names a tile and participates in dependency
    /// tracking.
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(
            self,
            AccessMode::Read | AccessMode::Write | AccessMode::ReadWrite | AccessMode::AtomicWrite
        )
    }

    /// Whether this mode writes the tile. Atomic writes chain like writes.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            AccessMode::Write | AccessMode::ReadWrite | AccessMode::AtomicWrite
        )
    }

    fn from_bits(bits: u8) -> Option<AccessMode> {
        match bits {
            1 => Some(AccessMode::Read),
            2 => Some(AccessMode::Write),
            3 => Some(AccessMode::ReadWrite),
            4 => Some(AccessMode::AtomicWrite),
            5 => Some(AccessMode::Scratch),
            6 => Some(AccessMode::Value),
            _ => None,
        }
    }
}

/// Stable identity of a pool-allocated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    /// Task class the task was allocated from.
    pub class: u8,
    /// Pool slot index.
    pub slot: u32,
    /// Slot generation at allocation time.
    pub gen: u16,
}

/// One user record: a task reference plus the flow it touched a tile with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserWord {
    /// The recorded task.
    pub task: TaskRef,
    /// Flow index within the recorded task.
    pub flow: u8,
    /// Access mode of that flow.
    pub mode: AccessMode,
    /// The recorded task has not retired this record.
    pub alive: bool,
    /// The producer of this read chain has completed.
    pub producer_done: bool,
}

pub(crate) mod word {
    use super::{AccessMode, TaskRef, UserWord};

    /// No record present (tile never touched, edge not wired).
    pub const EMPTY: u64 = 0;
    /// A recorded "no predecessor" in a flow's predecessor word.
    pub const NONE: u64 = 1;

    const SLOT_SHIFT: u32 = 0;
    const GEN_SHIFT: u32 = 24;
    const CLASS_SHIFT: u32 = 40;
    const FLOW_SHIFT: u32 = 48;
    const MODE_SHIFT: u32 = 54;
    const ALIVE: u64 = 1 << 57;
    const DONE: u64 = 1 << 58;
    const OCCUPIED: u64 = 1 << 63;

    const SLOT_MASK: u64 = (1 << 24) - 1;
    const GEN_MASK: u64 = (1 << 16) - 1;
    const CLASS_MASK: u64 = (1 << 8) - 1;
    const FLOW_MASK: u64 = (1 << 6) - 1;
    const MODE_MASK: u64 = (1 << 3) - 1;

    pub fn pack(user: &UserWord) -> u64 {
        debug_assert!((user.flow as u64) <= FLOW_MASK);
        OCCUPIED
            | ((user.task.slot as u64 & SLOT_MASK) << SLOT_SHIFT)
            | ((user.task.gen as u64 & GEN_MASK) << GEN_SHIFT)
            | ((user.task.class as u64 & CLASS_MASK) << CLASS_SHIFT)
            | ((user.flow as u64 & FLOW_MASK) << FLOW_SHIFT)
            | ((user.mode as u64 & MODE_MASK) << MODE_SHIFT)
            | if user.alive { ALIVE } else { 0 }
            | if user.producer_done { DONE } else { 0 }
    }

    pub fn unpack(raw: u64) -> Option<UserWord> {
        if raw & OCCUPIED == 0 {
            return None;
        }
        let mode = AccessMode::from_bits(((raw >> MODE_SHIFT) & MODE_MASK) as u8)?;
        Some(UserWord {
            task: TaskRef {
                class: ((raw >> CLASS_SHIFT) & CLASS_MASK) as u8,
                slot: ((raw >> SLOT_SHIFT) & SLOT_MASK) as u32,
                gen: ((raw >> GEN_SHIFT) & GEN_MASK) as u16,
            },
            flow: ((raw >> FLOW_SHIFT) & FLOW_MASK) as u8,
            mode,
            alive: raw & ALIVE != 0,
            producer_done: raw & DONE != 0,
        })
    }

    /// The same record with the alive bit cleared (retired).
    #[inline]
    pub fn retired(raw: u64) -> u64 {
        raw & !ALIVE
    }

    /// The same record with the producer-done bit set.
    #[inline]
    pub fn producer_done(raw: u64) -> u64 {
        raw | DONE
    }
}

/// One data-argument slot of a task: the tile it touches, the access mode,
/// and the packed dependency edges discovered at insertion time.
#[derive(Debug)]
pub struct FlowSlot {
    tile: Arc<Tile>,
    mode: AccessMode,
    pred: AtomicU64,
    succ: AtomicU64,
    eager_release: AtomicBool,
}

impl FlowSlot {
    pub(crate) fn new(tile: Arc<Tile>, mode: AccessMode) -> Self {
        Self {
            tile,
            mode,
            pred: AtomicU64::new(word::EMPTY),
            succ: AtomicU64::new(word::EMPTY),
            eager_release: AtomicBool::new(false),
        }
    }

    /// The tile this flow touches.
    #[inline]
    pub fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }

    /// Access mode of this flow.
    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The recorded predecessor, if any. Returns `None` both while the
    /// record is pending and when the flow has no predecessor; use
    /// [`FlowSlot::pred_wait`] on paths that must distinguish the two.
    #[inline]
    pub fn predecessor(&self) -> Option<UserWord> {
        word::unpack(self.pred.load(Ordering::Acquire))
    }

    /// The recorded successor, if one has been wired.
    #[inline]
    pub fn successor(&self) -> Option<UserWord> {
        word::unpack(self.succ.load(Ordering::Acquire))
    }

    /// Record that this flow has no predecessor.
    #[inline]
    pub(crate) fn set_pred_none(&self) {
        self.pred.store(word::NONE, Ordering::Release);
    }

    /// Record this flow's predecessor.
    #[inline]
    pub(crate) fn set_pred(&self, user: &UserWord) {
        self.pred.store(word::pack(user), Ordering::Release);
    }

    /// Wait for the predecessor record to be published, then return it.
    ///
    /// The record is written a few instructions after the swap that makes the
    /// owning task visible, so the spin here is bounded.
    pub(crate) fn pred_wait(&self) -> Option<UserWord> {
        loop {
            let raw = self.pred.load(Ordering::Acquire);
            if raw != word::EMPTY {
                return word::unpack(raw);
            }
            std::hint::spin_loop();
        }
    }

    /// Publish this flow's successor as one atomic release-store, so a
    /// concurrent reader never observes a half-written edge.
    #[inline]
    pub(crate) fn publish_successor(&self, user: &UserWord) {
        self.succ.store(word::pack(user), Ordering::Release);
    }

    /// Flag a first-touch read, so the data is not retained for a
    /// continuation that will never exist.
    #[inline]
    pub(crate) fn mark_eager_release(&self) {
        self.eager_release.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn eager_release(&self) -> bool {
        self.eager_release.load(Ordering::Relaxed)
    }
}
