/*!
 * Segment Allocator
 *
 * Two-level allocator over the segment: small requests go to slab slots
 * inside single chunks (per-size-class bins), larger requests take runs of
 * whole chunks. All bookkeeping is in terms of offsets from the segment
 * base, so the persistent layout survives re-mounting at a new address.
 *
 * A single lock covers the chunk directory, the bins, and the backing
 * storage; allocation may extend the backing files under that lock.
 */

mod bins;
mod chunk_dir;
mod size_class;

pub use bins::{BinManager, SlabDisposition};
pub use chunk_dir::{ChunkDirectory, ChunkState};
pub use size_class::{class_for_aligned, class_for_size, slot_size, NUM_CLASSES, SIZE_CLASSES};

use crate::core::types::{round_up, ChunkNo, Offset, StoreStats, CHUNK_SIZE, STATE_FORMAT_VERSION};
use crate::core::{StoreError, StoreResult};
use crate::os;
use crate::segment::SegmentStorage;
use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::Path;

struct AllocInner {
    storage: SegmentStorage,
    chunks: ChunkDirectory,
    bins: BinManager,
    used_bytes: usize,
}

/// Façade combining the chunk directory and the bin manager; owns the
/// segment storage behind the single allocator lock.
pub struct SegmentAllocator {
    base: *mut u8,
    vm_capacity: usize,
    read_only: bool,
    inner: Mutex<AllocInner>,
}

// SAFETY: the base pointer is fixed for the allocator's lifetime and all
// mutable state is behind the mutex.
unsafe impl Send for SegmentAllocator {}
unsafe impl Sync for SegmentAllocator {}

impl SegmentAllocator {
    /// Wrap a freshly created (empty) segment.
    pub fn create(storage: SegmentStorage) -> Self {
        Self {
            base: storage.base(),
            vm_capacity: storage.vm_capacity(),
            read_only: false,
            inner: Mutex::new(AllocInner {
                storage,
                chunks: ChunkDirectory::new(),
                bins: BinManager::new(),
                used_bytes: 0,
            }),
        }
    }

    /// Wrap an existing segment, restoring bookkeeping from `state_path`.
    pub fn open(storage: SegmentStorage, state_path: &Path) -> StoreResult<Self> {
        let (chunks, bins) = Self::load_state(state_path)?;
        if chunks.len() * CHUNK_SIZE != storage.current_size() {
            return Err(StoreError::corrupted(format!(
                "allocator tracks {} chunks but segment holds {} bytes",
                chunks.len(),
                storage.current_size()
            )));
        }
        let mut used_bytes = bins.used_bytes();
        for (_, state) in chunks.iter() {
            if let ChunkState::LargeHead { run } = state {
                used_bytes += run as usize * CHUNK_SIZE;
            }
        }
        Ok(Self {
            base: storage.base(),
            vm_capacity: storage.vm_capacity(),
            read_only: storage.is_read_only(),
            inner: Mutex::new(AllocInner {
                storage,
                chunks,
                bins,
                used_bytes,
            }),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn vm_capacity(&self) -> usize {
        self.vm_capacity
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn current_size(&self) -> usize {
        self.inner.lock().storage.current_size()
    }

    /// Allocate `nbytes` with natural alignment; returns the offset of the
    /// allocation head.
    pub fn allocate(&self, nbytes: usize) -> StoreResult<Offset> {
        self.allocate_aligned(nbytes, 1)
    }

    /// Allocate `nbytes` at an offset divisible by `align` (a power of two
    /// no larger than the chunk size).
    pub fn allocate_aligned(&self, nbytes: usize, align: usize) -> StoreResult<Offset> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if nbytes == 0 {
            return Err(StoreError::invalid_argument("zero-byte allocation"));
        }
        if align == 0 || !align.is_power_of_two() || align > CHUNK_SIZE {
            return Err(StoreError::invalid_argument(format!(
                "unsupported alignment {}",
                align
            )));
        }

        let mut inner = self.inner.lock();
        let offset = if let Some(class) = class_for_aligned(nbytes, align) {
            Self::alloc_small(&mut inner, self.vm_capacity, class)?
        } else {
            Self::alloc_large(&mut inner, self.vm_capacity, nbytes)?
        };
        debug_assert!(offset >= 0);
        debug_assert!(offset as usize + nbytes <= inner.storage.current_size());
        debug_assert_eq!(offset as usize % align, 0);
        debug!("allocated {} bytes at offset {}", nbytes, offset);
        Ok(offset)
    }

    /// Release the allocation whose head is at `offset`
    pub fn deallocate(&self, offset: Offset) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut inner = self.inner.lock();
        let (chunk, rel) = Self::locate(&inner, offset)?;
        match inner.chunks.state(chunk) {
            Some(ChunkState::Slab { class }) => {
                let class = class as usize;
                let slot_bytes = slot_size(class);
                if rel % slot_bytes != 0 {
                    return Err(StoreError::invalid_argument(format!(
                        "offset {} is not a slot boundary",
                        offset
                    )));
                }
                let slot = (rel / slot_bytes) as u32;
                if inner.bins.deallocate(class, chunk, slot)? == SlabDisposition::Emptied {
                    inner.chunks.mark_free(chunk);
                }
                inner.used_bytes -= slot_bytes;
            }
            Some(ChunkState::LargeHead { run }) => {
                if rel != 0 {
                    return Err(StoreError::invalid_argument(format!(
                        "offset {} is not the head of its run",
                        offset
                    )));
                }
                inner.chunks.mark_free_run(chunk)?;
                inner.used_bytes -= run as usize * CHUNK_SIZE;
            }
            Some(ChunkState::LargeTail { .. }) => {
                return Err(StoreError::invalid_argument(format!(
                    "offset {} points inside a large allocation",
                    offset
                )));
            }
            Some(ChunkState::Free) | None => {
                return Err(StoreError::invalid_argument(format!(
                    "offset {} is not allocated",
                    offset
                )));
            }
        }
        debug!("deallocated offset {}", offset);
        Ok(())
    }

    /// Byte length of the allocation whose head is at `offset`; fails with
    /// `invalid_argument` when `offset` is not an allocation head.
    pub fn block_len(&self, offset: Offset) -> StoreResult<usize> {
        let inner = self.inner.lock();
        let (chunk, rel) = Self::locate(&inner, offset)?;
        match inner.chunks.state(chunk) {
            Some(ChunkState::Slab { class }) => {
                let class = class as usize;
                let slot_bytes = slot_size(class);
                if rel % slot_bytes != 0
                    || !inner.bins.is_allocated(class, chunk, (rel / slot_bytes) as u32)
                {
                    return Err(StoreError::invalid_argument(format!(
                        "offset {} is not an allocation head",
                        offset
                    )));
                }
                Ok(slot_bytes)
            }
            Some(ChunkState::LargeHead { run }) if rel == 0 => Ok(run as usize * CHUNK_SIZE),
            _ => Err(StoreError::invalid_argument(format!(
                "offset {} is not an allocation head",
                offset
            ))),
        }
    }

    /// True when the chunk directory holds no allocation at all.
    /// Expensive: scans the whole directory.
    pub fn all_deallocated(&self) -> bool {
        self.inner.lock().chunks.all_free()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            vm_capacity: self.vm_capacity,
            segment_size: inner.storage.current_size(),
            used_bytes: inner.used_bytes,
            total_chunks: inner.chunks.len(),
            free_chunks: inner.chunks.free_chunks(),
        }
    }

    /// Flush segment pages to the backing files
    pub fn sync(&self, synchronous: bool) -> StoreResult<()> {
        self.inner.lock().storage.sync(synchronous)
    }

    /// Write the allocator state (chunk directory + bins) to `path`,
    /// version-tagged and CRC-guarded against torn writes.
    pub fn serialize(&self, path: &Path) -> StoreResult<()> {
        let inner = self.inner.lock();
        let mut buf = vec![STATE_FORMAT_VERSION];
        inner.chunks.encode(&mut buf);
        inner.bins.encode(&mut buf);
        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc).expect("vec write");
        os::write_durable(path, &buf)
    }

    /// Unmap the segment and close its files (does not delete)
    pub fn shutdown(&self) -> StoreResult<()> {
        self.inner.lock().storage.destroy()
    }

    fn load_state(path: &Path) -> StoreResult<(ChunkDirectory, BinManager)> {
        let data = std::fs::read(path)?;
        if data.len() < 5 {
            return Err(StoreError::corrupted("allocator state file too short"));
        }
        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(StoreError::corrupted("allocator state CRC mismatch"));
        }
        if payload[0] != STATE_FORMAT_VERSION {
            return Err(StoreError::corrupted(format!(
                "allocator state version {} unsupported",
                payload[0]
            )));
        }
        let mut cursor = Cursor::new(&payload[1..]);
        let chunks = ChunkDirectory::decode(&mut cursor)?;
        let bins = BinManager::decode(&mut cursor)?;
        Ok((chunks, bins))
    }

    fn locate(inner: &AllocInner, offset: Offset) -> StoreResult<(ChunkNo, usize)> {
        if offset < 0 || offset as usize >= inner.storage.current_size() {
            return Err(StoreError::invalid_argument(format!(
                "offset {} outside the segment",
                offset
            )));
        }
        let chunk = (offset as usize / CHUNK_SIZE) as ChunkNo;
        Ok((chunk, offset as usize % CHUNK_SIZE))
    }

    fn alloc_small(
        inner: &mut AllocInner,
        vm_capacity: usize,
        class: usize,
    ) -> StoreResult<Offset> {
        let (chunk, slot) = match inner.bins.allocate(class) {
            Some(hit) => hit,
            None => {
                let chunk = Self::ensure_free_run(inner, vm_capacity, 1, 1, slot_size(class))?;
                inner.chunks.mark_slab(chunk, class as u32);
                inner.bins.add_slab(class, chunk);
                inner
                    .bins
                    .allocate(class)
                    .ok_or_else(|| StoreError::corrupted("fresh slab yielded no slot"))?
            }
        };
        inner.used_bytes += slot_size(class);
        Ok((ChunkDirectory::chunk_start(chunk) + slot as usize * slot_size(class)) as Offset)
    }

    fn alloc_large(
        inner: &mut AllocInner,
        vm_capacity: usize,
        nbytes: usize,
    ) -> StoreResult<Offset> {
        let n_chunks = round_up(nbytes, CHUNK_SIZE) / CHUNK_SIZE;
        let head = Self::ensure_free_run(inner, vm_capacity, n_chunks, 1, nbytes)?;
        inner.chunks.mark_large(head, n_chunks as u32);
        inner.used_bytes += n_chunks * CHUNK_SIZE;
        Ok(ChunkDirectory::chunk_start(head) as Offset)
    }

    /// Find a free run, extending the backing store by whole chunks when the
    /// existing directory has none.
    fn ensure_free_run(
        inner: &mut AllocInner,
        vm_capacity: usize,
        n_chunks: usize,
        align_chunks: usize,
        requested: usize,
    ) -> StoreResult<ChunkNo> {
        if let Some(chunk) = inner.chunks.find_free_run(n_chunks, align_chunks) {
            return Ok(chunk);
        }
        let trailing = inner.chunks.trailing_free();
        let mut start = inner.chunks.len() - trailing;
        if align_chunks > 1 {
            start = round_up(start, align_chunks);
        }
        let new_len = start + n_chunks;
        if !inner.storage.extend(new_len * CHUNK_SIZE)? {
            return Err(StoreError::OutOfMemory {
                requested,
                segment_size: inner.storage.current_size(),
                capacity: vm_capacity,
            });
        }
        inner.chunks.grow_to(new_len);
        Ok(start as ChunkNo)
    }
}
