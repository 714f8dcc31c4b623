//! Tiles: addressable units of data and their most recent users.
//!
//! A tile is created lazily the first time a task references a unit of data,
//! and from then on it is the record the dependency resolver consults: its
//! last-user word names the most recently inserted task touching the tile,
//! and swapping that word is the single serialization point for establishing
//! a dependency edge. Tiles are reference counted; the registry holds one
//! reference and every task flow holds one for the task's lifetime.

mod descriptor;

pub use descriptor::{DataDescriptor, DataHandle, TiledMatrix};

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::task::flow::word;

/// One unit of addressable data, tracking its most recent user.
pub struct Tile {
    key: u64,
    rank: u32,
    lane: usize,
    data: DataHandle,
    slot: u32,
    gen: u16,
    last_user: AtomicU64,
    refs: AtomicI32,
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("key", &format_args!("{:#x}", self.key))
            .field("rank", &self.rank)
            .field("lane", &self.lane)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl Tile {
    pub(crate) fn new(
        key: u64,
        rank: u32,
        lane: usize,
        data: DataHandle,
        slot: u32,
        gen: u16,
    ) -> Self {
        Self {
            key,
            rank,
            lane,
            data,
            slot,
            gen,
            last_user: AtomicU64::new(word::EMPTY),
            // The registry's reference.
            refs: AtomicI32::new(1),
        }
    }

    /// Combine a descriptor identity and a local index into one 64-bit key.
    #[inline]
    pub fn compose_key(descriptor_id: u32, local_index: u32) -> u64 {
        ((descriptor_id as u64) << 32) | local_index as u64
    }

    /// The tile's composite key.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Rank owning this tile's data.
    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Execution lane the descriptor associates with this tile.
    #[inline]
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Handle to the tile's data.
    #[inline]
    pub fn data(&self) -> &DataHandle {
        &self.data
    }

    /// The packed last-user word.
    #[inline]
    pub(crate) fn last_user(&self) -> &AtomicU64 {
        &self.last_user
    }

    /// Pool identity of this tile.
    #[inline]
    pub(crate) fn pool_slot(&self) -> (u32, u16) {
        (self.slot, self.gen)
    }

    /// Current reference count.
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take a reference to this tile.
    #[inline]
    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; returns true when the count reaches zero.
    ///
    /// An underflow means the engine released a tile it did not hold, which
    /// is a fatal bookkeeping error.
    pub(crate) fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            panic!("tile {:#x} reference count underflow", self.key);
        }
        previous == 1
    }
}
