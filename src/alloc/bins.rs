/*!
 * Bin Manager
 * Per-size-class slab bookkeeping: bitmaps, free counts, and
 * occupancy-ordered partial lists
 */

use super::size_class::{slots_per_chunk, NUM_CLASSES};
use crate::core::types::ChunkNo;
use crate::core::{StoreError, StoreResult};
use ahash::RandomState;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;

/// A chunk subdivided into same-size slots. A set bit marks a slot in use;
/// bits past `n_slots` are pre-set so they can never be handed out.
#[derive(Debug, Clone)]
pub struct Slab {
    chunk_no: ChunkNo,
    bitmap: Vec<u64>,
    free_count: u32,
    n_slots: u32,
}

impl Slab {
    fn new(chunk_no: ChunkNo, class: usize) -> Self {
        let n_slots = slots_per_chunk(class) as u32;
        let words = ((n_slots + 63) / 64) as usize;
        let mut bitmap = vec![0u64; words];
        for slot in n_slots..(words as u32 * 64) {
            bitmap[slot as usize / 64] |= 1 << (slot % 64);
        }
        Self {
            chunk_no,
            bitmap,
            free_count: n_slots,
            n_slots,
        }
    }

    /// Claim the first clear bit
    fn acquire(&mut self) -> Option<u32> {
        for (w, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                *word |= 1 << bit;
                self.free_count -= 1;
                return Some(w as u32 * 64 + bit);
            }
        }
        None
    }

    fn release(&mut self, slot: u32) -> StoreResult<()> {
        if slot >= self.n_slots {
            return Err(StoreError::invalid_argument(format!(
                "slot {} out of range for slab of {} slots",
                slot, self.n_slots
            )));
        }
        let word = &mut self.bitmap[slot as usize / 64];
        let mask = 1u64 << (slot % 64);
        if *word & mask == 0 {
            return Err(StoreError::invalid_argument(format!(
                "slot {} in chunk {} is already free",
                slot, self.chunk_no
            )));
        }
        *word &= !mask;
        self.free_count += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn is_empty(&self) -> bool {
        self.free_count == self.n_slots
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }
}

/// Whether a deallocation left its slab partially used or empty.
/// Empty slabs are handed back to the chunk directory by the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum SlabDisposition {
    Kept,
    Emptied,
}

#[derive(Debug, Default)]
struct ClassBins {
    slabs: HashMap<ChunkNo, Slab, RandomState>,
    /// Partially-free slabs keyed by (free_count, chunk_no); the minimum is
    /// the most occupied slab, which takes the next allocation so sparse
    /// slabs drain and free whole chunks earlier.
    partial: BTreeSet<(u32, ChunkNo)>,
}

/// Slab bookkeeping for every size class
#[derive(Debug)]
pub struct BinManager {
    classes: Vec<ClassBins>,
}

impl Default for BinManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BinManager {
    pub fn new() -> Self {
        let mut classes = Vec::with_capacity(NUM_CLASSES);
        classes.resize_with(NUM_CLASSES, ClassBins::default);
        Self { classes }
    }

    /// Allocate a slot from the most occupied partial slab of `class`.
    /// Returns `(chunk_no, slot)` or `None` when no partial slab exists.
    pub fn allocate(&mut self, class: usize) -> Option<(ChunkNo, u32)> {
        let bins = &mut self.classes[class];
        let &(free, chunk_no) = bins.partial.iter().next()?;
        let slab = bins.slabs.get_mut(&chunk_no)?;
        let slot = slab.acquire()?;
        bins.partial.remove(&(free, chunk_no));
        if !slab.is_full() {
            bins.partial.insert((slab.free_count, chunk_no));
        }
        Some((chunk_no, slot))
    }

    /// Register a fresh slab for `class` over an empty chunk
    pub fn add_slab(&mut self, class: usize, chunk_no: ChunkNo) {
        let slab = Slab::new(chunk_no, class);
        let bins = &mut self.classes[class];
        bins.partial.insert((slab.free_count, chunk_no));
        bins.slabs.insert(chunk_no, slab);
    }

    /// Release a slot. On `Emptied` the slab has been dropped and the chunk
    /// must be returned to the chunk directory.
    pub fn deallocate(
        &mut self,
        class: usize,
        chunk_no: ChunkNo,
        slot: u32,
    ) -> StoreResult<SlabDisposition> {
        let bins = &mut self.classes[class];
        let slab = bins.slabs.get_mut(&chunk_no).ok_or_else(|| {
            StoreError::invalid_argument(format!("chunk {} holds no slab", chunk_no))
        })?;
        let was_full = slab.is_full();
        slab.release(slot)?;
        if !was_full {
            bins.partial.remove(&(slab.free_count - 1, chunk_no));
        }
        if slab.is_empty() {
            bins.slabs.remove(&chunk_no);
            bins.partial.remove(&(slots_per_chunk(class) as u32, chunk_no));
            return Ok(SlabDisposition::Emptied);
        }
        bins.partial.insert((slab.free_count, chunk_no));
        Ok(SlabDisposition::Kept)
    }

    /// Whether `slot` of the slab over `chunk_no` is currently handed out
    pub fn is_allocated(&self, class: usize, chunk_no: ChunkNo, slot: u32) -> bool {
        match self.classes[class].slabs.get(&chunk_no) {
            Some(slab) if slot < slab.n_slots => {
                slab.bitmap[slot as usize / 64] & (1 << (slot % 64)) != 0
            }
            _ => false,
        }
    }

    /// Bytes handed out across every slab
    pub fn used_bytes(&self) -> usize {
        self.classes
            .iter()
            .enumerate()
            .map(|(class, bins)| {
                bins.slabs
                    .values()
                    .map(|s| (s.n_slots - s.free_count) as usize * super::size_class::slot_size(class))
                    .sum::<usize>()
            })
            .sum()
    }

    /// Total free slots across the partial slabs of `class`
    pub fn free_slots(&self, class: usize) -> usize {
        self.classes[class]
            .slabs
            .values()
            .map(|s| s.free_count as usize)
            .sum()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<LittleEndian>(NUM_CLASSES as u16)
            .expect("vec write");
        for bins in &self.classes {
            buf.write_u32::<LittleEndian>(bins.slabs.len() as u32)
                .expect("vec write");
            // Deterministic order keeps state files byte-stable.
            let mut chunks: Vec<_> = bins.slabs.keys().copied().collect();
            chunks.sort_unstable();
            for chunk_no in chunks {
                let slab = &bins.slabs[&chunk_no];
                buf.write_u32::<LittleEndian>(chunk_no).expect("vec write");
                buf.write_u32::<LittleEndian>(slab.free_count)
                    .expect("vec write");
                buf.write_u32::<LittleEndian>(slab.bitmap.len() as u32)
                    .expect("vec write");
                for word in &slab.bitmap {
                    buf.write_u64::<LittleEndian>(*word).expect("vec write");
                }
            }
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> StoreResult<Self> {
        let corrupt = || StoreError::corrupted("truncated bin state");
        let n_classes = cursor.read_u16::<LittleEndian>().map_err(|_| corrupt())? as usize;
        if n_classes != NUM_CLASSES {
            return Err(StoreError::corrupted(format!(
                "bin state has {} classes, expected {}",
                n_classes, NUM_CLASSES
            )));
        }
        let mut manager = Self::new();
        for class in 0..n_classes {
            let n_slabs = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
            for _ in 0..n_slabs {
                let chunk_no = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
                let free_count = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
                let n_words = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt())? as usize;
                let mut slab = Slab::new(chunk_no, class);
                if n_words != slab.bitmap.len() || free_count > slab.n_slots {
                    return Err(StoreError::corrupted(format!(
                        "bin state slab for chunk {} is malformed",
                        chunk_no
                    )));
                }
                for word in &mut slab.bitmap {
                    *word = cursor.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
                }
                let clear_bits: u32 = slab.bitmap.iter().map(|w| w.count_zeros()).sum();
                if clear_bits != free_count {
                    return Err(StoreError::corrupted(format!(
                        "bin state free count {} disagrees with bitmap ({} clear)",
                        free_count, clear_bits
                    )));
                }
                slab.free_count = free_count;
                let bins = &mut manager.classes[class];
                if free_count > 0 {
                    bins.partial.insert((free_count, chunk_no));
                }
                bins.slabs.insert(chunk_no, slab);
            }
        }
        Ok(manager)
    }
}
