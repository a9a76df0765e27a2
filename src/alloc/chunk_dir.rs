/*!
 * Chunk Directory
 * Dense per-chunk state array with first-fit run search
 */

use crate::core::types::{ChunkNo, CHUNK_SIZE};
use crate::core::{StoreError, StoreResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// State of a single chunk.
///
/// Invariant: free, slab, and large runs partition `[0, high_water)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Free,
    /// Subdivided into slots of a size class
    Slab { class: u32 },
    /// First of `run` consecutive chunks allocated for one object
    LargeHead { run: u32 },
    /// Follower of a large run, pointing back to its head
    LargeTail { head: ChunkNo },
}

const TAG_FREE: u8 = 0;
const TAG_SLAB: u8 = 1;
const TAG_LARGE_HEAD: u8 = 2;
const TAG_LARGE_TAIL: u8 = 3;

/// Dense array of chunk states indexed by chunk number
#[derive(Debug, Default)]
pub struct ChunkDirectory {
    entries: Vec<ChunkState>,
}

impl ChunkDirectory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of chunks tracked (the high-water mark)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, chunk: ChunkNo) -> Option<ChunkState> {
        self.entries.get(chunk as usize).copied()
    }

    /// Track `n` chunks, new ones starting free
    pub fn grow_to(&mut self, n: usize) {
        debug_assert!(n >= self.entries.len());
        self.entries.resize(n, ChunkState::Free);
    }

    /// Length of the free run ending at the high-water mark
    pub fn trailing_free(&self) -> usize {
        self.entries
            .iter()
            .rev()
            .take_while(|s| **s == ChunkState::Free)
            .count()
    }

    /// First-fit search for `n_chunks` consecutive free chunks starting at a
    /// multiple of `align_chunks`. Ties break toward the lowest chunk number.
    pub fn find_free_run(&self, n_chunks: usize, align_chunks: usize) -> Option<ChunkNo> {
        debug_assert!(n_chunks > 0);
        let align = align_chunks.max(1);
        let len = self.entries.len();
        let mut i = 0;
        while i + n_chunks <= len {
            if i % align != 0 {
                i += align - i % align;
                continue;
            }
            match self.entries[i..i + n_chunks]
                .iter()
                .position(|s| *s != ChunkState::Free)
            {
                None => return Some(i as ChunkNo),
                Some(busy) => i += busy + 1,
            }
        }
        None
    }

    pub fn mark_slab(&mut self, chunk: ChunkNo, class: u32) {
        debug_assert_eq!(self.entries[chunk as usize], ChunkState::Free);
        self.entries[chunk as usize] = ChunkState::Slab { class };
    }

    pub fn mark_large(&mut self, head: ChunkNo, run: u32) {
        let start = head as usize;
        debug_assert!(self.entries[start..start + run as usize]
            .iter()
            .all(|s| *s == ChunkState::Free));
        self.entries[start] = ChunkState::LargeHead { run };
        for follower in &mut self.entries[start + 1..start + run as usize] {
            *follower = ChunkState::LargeTail { head };
        }
    }

    /// Free a single slab chunk
    pub fn mark_free(&mut self, chunk: ChunkNo) {
        debug_assert!(matches!(
            self.entries[chunk as usize],
            ChunkState::Slab { .. }
        ));
        self.entries[chunk as usize] = ChunkState::Free;
    }

    /// Free the large run headed at `head`; returns the run length
    pub fn mark_free_run(&mut self, head: ChunkNo) -> StoreResult<usize> {
        let run = match self.state(head) {
            Some(ChunkState::LargeHead { run }) => run as usize,
            _ => {
                return Err(StoreError::invalid_argument(format!(
                    "chunk {} is not the head of a large run",
                    head
                )))
            }
        };
        for state in &mut self.entries[head as usize..head as usize + run] {
            *state = ChunkState::Free;
        }
        Ok(run)
    }

    pub fn free_chunks(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| **s == ChunkState::Free)
            .count()
    }

    pub fn all_free(&self) -> bool {
        self.entries.iter().all(|s| *s == ChunkState::Free)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkNo, ChunkState)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, s)| (i as ChunkNo, *s))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)
            .expect("vec write");
        for state in &self.entries {
            let (tag, arg) = match *state {
                ChunkState::Free => (TAG_FREE, 0u32),
                ChunkState::Slab { class } => (TAG_SLAB, class),
                ChunkState::LargeHead { run } => (TAG_LARGE_HEAD, run),
                ChunkState::LargeTail { head } => (TAG_LARGE_TAIL, head),
            };
            buf.push(tag);
            buf.write_u32::<LittleEndian>(arg).expect("vec write");
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> StoreResult<Self> {
        let n = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| StoreError::corrupted("truncated chunk directory"))?
            as usize;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let tag = cursor
                .read_u8()
                .map_err(|_| StoreError::corrupted("truncated chunk directory"))?;
            let arg = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| StoreError::corrupted("truncated chunk directory"))?;
            entries.push(match tag {
                TAG_FREE => ChunkState::Free,
                TAG_SLAB => ChunkState::Slab { class: arg },
                TAG_LARGE_HEAD => ChunkState::LargeHead { run: arg },
                TAG_LARGE_TAIL => ChunkState::LargeTail { head: arg },
                other => {
                    return Err(StoreError::corrupted(format!(
                        "unknown chunk state tag {}",
                        other
                    )))
                }
            });
        }
        Ok(Self { entries })
    }

    /// Byte offset of a chunk's start
    #[inline]
    pub fn chunk_start(chunk: ChunkNo) -> usize {
        chunk as usize * CHUNK_SIZE
    }
}
