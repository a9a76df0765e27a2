/*!
 * Segment Header
 * Per-mapping anchor placed in the chunk ahead of the segment
 */

use crate::alloc::SegmentAllocator;
use crate::core::types::CHUNK_SIZE;

const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"HEAPSTOR");

/// Lives in the anonymous chunk directly in front of the segment data.
/// Holds the self-pointer through which in-heap allocators recover the
/// allocator from the segment base. Rewritten on every attach, read-only
/// afterwards; never persisted.
#[repr(C)]
pub struct SegmentHeader {
    magic: u64,
    allocator: *const SegmentAllocator,
}

impl SegmentHeader {
    /// Install a header at the start of `region` (the reservation base).
    ///
    /// # Safety
    /// `region` must point at a writable anonymous mapping of at least one
    /// chunk, owned by the caller.
    pub unsafe fn install(region: *mut u8, allocator: *const SegmentAllocator) {
        let header = region as *mut SegmentHeader;
        header.write(SegmentHeader {
            magic: HEADER_MAGIC,
            allocator,
        });
    }

    /// Recover the header from a segment base.
    ///
    /// # Safety
    /// `segment_base` must be the base of a live segment attached by this
    /// process (the header chunk sits directly in front of it).
    pub unsafe fn from_segment_base<'a>(segment_base: *const u8) -> Option<&'a SegmentHeader> {
        let header = &*(segment_base.sub(CHUNK_SIZE) as *const SegmentHeader);
        (header.magic == HEADER_MAGIC).then_some(header)
    }

    pub fn allocator(&self) -> *const SegmentAllocator {
        self.allocator
    }
}
