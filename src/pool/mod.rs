//! Fixed-capacity object pools.
//!
//! Tasks and tiles are carved out of slab pools instead of the general
//! allocator. A pool slot carries a generation counter that is bumped on
//! every release, so a `(slot, generation)` pair is a stable identity that
//! can be packed into dependency words: a stale reference simply fails to
//! resolve instead of aliasing a recycled object. Pools never grow past
//! their configured capacity; exhaustion is surfaced as an error.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;

/// Slots are referenced by 24-bit indices inside packed dependency words.
pub const MAX_POOL_CAPACITY: usize = 1 << 24;

#[derive(Debug)]
struct Slot<T> {
    gen: u16,
    value: Option<Arc<T>>,
}

#[derive(Debug)]
struct PoolInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// A fixed-capacity slab pool handing out `Arc`ed objects with
/// `(slot, generation)` identities.
#[derive(Debug)]
pub struct Pool<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
}

impl<T> Pool<T> {
    /// Create a pool that will hold at most `capacity` live objects.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(
            capacity <= MAX_POOL_CAPACITY,
            "pool capacity exceeds addressable slots"
        );
        Self {
            name,
            capacity,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Allocate a slot and construct its object with `build`, which receives
    /// the slot index and generation so the object can record its own
    /// identity.
    pub fn insert_with(
        &self,
        build: impl FnOnce(u32, u16) -> T,
    ) -> Result<Arc<T>, EngineError> {
        let mut inner = self.inner.lock();
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                if inner.slots.len() >= self.capacity {
                    return Err(EngineError::PoolExhausted {
                        pool: self.name,
                        capacity: self.capacity,
                    });
                }
                let slot = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    gen: 0,
                    value: None,
                });
                slot
            }
        };
        let gen = inner.slots[slot as usize].gen;
        let value = Arc::new(build(slot, gen));
        inner.slots[slot as usize].value = Some(value.clone());
        Ok(value)
    }

    /// Resolve a `(slot, generation)` reference. Returns `None` if the slot
    /// has been released since the reference was taken.
    pub fn get(&self, slot: u32, gen: u16) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        let entry = inner.slots.get(slot as usize)?;
        if entry.gen != gen {
            return None;
        }
        entry.value.clone()
    }

    /// Release a slot back to the pool, invalidating its generation.
    ///
    /// Panics if the generation does not match the live object: releasing
    /// through a stale reference means the engine's lifecycle bookkeeping is
    /// broken.
    pub fn release(&self, slot: u32, gen: u16) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.slots[slot as usize];
        assert_eq!(
            entry.gen, gen,
            "{} pool slot {} released with stale generation",
            self.name, slot
        );
        entry.value = None;
        entry.gen = entry.gen.wrapping_add(1);
        inner.free.push(slot);
    }

    /// Drop every live object, breaking reference cycles at teardown.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for (index, entry) in inner.slots.iter_mut().enumerate() {
            if entry.value.take().is_some() {
                entry.gen = entry.gen.wrapping_add(1);
                inner.free.push(index as u32);
            }
        }
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Configured capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
