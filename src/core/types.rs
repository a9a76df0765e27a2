/*!
 * Core Types
 * Common types and layout constants used across the store
 */

use serde::{Deserialize, Serialize};

/// Byte distance from the segment base.
///
/// Every persistent reference inside the heap is an offset; absolute
/// addresses are computed on the fly and never written to disk.
pub type Offset = i64;

/// Chunk number type (dense index into the chunk directory)
pub type ChunkNo = u32;

/// Size type for memory operations
pub type Size = usize;

/// Unit of coarse allocation. Must be a multiple of the OS page size.
pub const CHUNK_SIZE: Size = 1 << 21; // 2 MiB

/// Number of chunks backed by a single `segment.<k>` file
pub const FILE_CHUNKS: Size = 64;

/// Byte span covered by one segment file
pub const SEGMENT_FILE_SIZE: Size = FILE_CHUNKS * CHUNK_SIZE; // 128 MiB

/// Default virtual-memory reservation for the segment
pub const DEFAULT_CAPACITY: Size = 1 << 34; // 16 GiB

/// Hard upper bound on the segment reservation
pub const MAX_SEGMENT_SIZE: Size = 1 << 44; // 16 TiB

/// Largest request served from a slab size class; bigger requests take
/// whole chunk runs
pub const MAX_SMALL_SIZE: Size = CHUNK_SIZE / 4; // 512 KiB

/// Version byte leading every serialized state file
pub const STATE_FORMAT_VERSION: u8 = 1;

/// Datastore version written at create time,
/// encoded as `major * 100_000 + minor * 100 + patch`
pub const STORE_VERSION: u32 = 100;

/// Round `n` up to the next multiple of `unit` (`unit` > 0)
#[inline]
pub const fn round_up(n: Size, unit: Size) -> Size {
    (n + unit - 1) / unit * unit
}

/// Segment usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub vm_capacity: Size,
    pub segment_size: Size,
    pub used_bytes: Size,
    pub total_chunks: usize,
    pub free_chunks: usize,
}

impl StoreStats {
    pub fn usage_percentage(&self) -> f64 {
        if self.vm_capacity == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.vm_capacity as f64 * 100.0
    }
}
