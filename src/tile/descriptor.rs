//! Data-descriptor collaborator contract.
//!
//! A descriptor maps logical coordinates onto tile keys, ownership, and data
//! handles. The engine calls the accessors exactly once per newly discovered
//! tile; everything else it needs lives on the tile record afterwards.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque handle to a tile's data.
pub type DataHandle = Arc<dyn Any + Send + Sync>;

/// Maps logical `(i, j)` coordinates onto tiles.
pub trait DataDescriptor: Send + Sync {
    /// Stable identity of this descriptor, combined with local indices to
    /// form tile keys.
    fn descriptor_id(&self) -> u32;

    /// Local index of the tile at `(i, j)`.
    fn data_key(&self, i: u32, j: u32) -> u32;

    /// Rank owning the tile.
    fn rank_of(&self, key: u32) -> u32;

    /// Execution lane associated with the tile.
    fn lane_of(&self, key: u32) -> usize;

    /// Handle to the tile's data.
    fn data_of(&self, key: u32) -> DataHandle;
}

/// A row-major grid of `f64` blocks, single rank, lanes assigned round-robin
/// by tile index. Suitable for tests, benches, and examples.
pub struct TiledMatrix {
    id: u32,
    rows: u32,
    cols: u32,
    lanes: usize,
    blocks: Vec<DataHandle>,
}

impl std::fmt::Debug for TiledMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledMatrix")
            .field("id", &self.id)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("lanes", &self.lanes)
            .finish()
    }
}

impl TiledMatrix {
    /// Create a matrix of `rows * cols` tiles of `block_len` elements each.
    pub fn new(id: u32, rows: u32, cols: u32, block_len: usize, lanes: usize) -> Self {
        let blocks = (0..rows as usize * cols as usize)
            .map(|_| Arc::new(Mutex::new(vec![0.0f64; block_len])) as DataHandle)
            .collect();
        Self {
            id,
            rows,
            cols,
            lanes: lanes.max(1),
            blocks,
        }
    }

    /// Number of tile rows.
    #[inline]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of tile columns.
    #[inline]
    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Borrow the block storage behind a data handle produced by this
    /// descriptor.
    pub fn block(handle: &DataHandle) -> &Mutex<Vec<f64>> {
        handle
            .downcast_ref::<Mutex<Vec<f64>>>()
            .expect("data handle does not belong to a TiledMatrix")
    }
}

impl DataDescriptor for TiledMatrix {
    fn descriptor_id(&self) -> u32 {
        self.id
    }

    fn data_key(&self, i: u32, j: u32) -> u32 {
        debug_assert!(i < self.rows && j < self.cols);
        i * self.cols + j
    }

    fn rank_of(&self, _key: u32) -> u32 {
        0
    }

    fn lane_of(&self, key: u32) -> usize {
        key as usize % self.lanes
    }

    fn data_of(&self, key: u32) -> DataHandle {
        self.blocks[key as usize].clone()
    }
}
