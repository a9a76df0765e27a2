/*!
 * Segment Storage
 * File-backed mapping that presents the persistent heap to user code
 *
 * The segment is backed by a series of `segment.<k>` files, each covering a
 * fixed span of chunks, mapped MAP_FIXED into a reservation owned by the
 * manager. The live size is the sum of the file lengths, so reopening needs
 * no extra metadata. Growth extends the current tail file to its full span
 * before starting the next one, so every file but the last is full.
 */

use crate::core::types::{CHUNK_SIZE, SEGMENT_FILE_SIZE};
use crate::core::{StoreError, StoreResult};
use crate::os;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Owns the file-backed mapping holding user data.
///
/// Confined behind the allocator lock; `extend` and `sync` may block on I/O.
pub struct SegmentStorage {
    dir: PathBuf,
    base: *mut u8,
    vm_capacity: usize,
    current_size: usize,
    files: Vec<File>,
    read_only: bool,
}

// SAFETY: the base pointer addresses a mapping owned by this storage; the
// storage itself is only reachable through the allocator's mutex.
unsafe impl Send for SegmentStorage {}

fn segment_file_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("segment.{}", index))
}

impl SegmentStorage {
    /// Create a fresh, empty segment inside `dir`, to be mapped at `base`.
    ///
    /// No backing file is created until the first `extend`.
    pub fn create(dir: &Path, base: *mut u8, vm_capacity: usize) -> Self {
        debug_assert_eq!(base as usize % CHUNK_SIZE, 0);
        info!(
            "segment created at {:p} (capacity {} bytes, dir {})",
            base,
            vm_capacity,
            dir.display()
        );
        Self {
            dir: dir.to_path_buf(),
            base,
            vm_capacity,
            current_size: 0,
            files: Vec::new(),
            read_only: false,
        }
    }

    /// Map an existing segment from `dir` at `base`.
    pub fn open(
        dir: &Path,
        base: *mut u8,
        vm_capacity: usize,
        read_only: bool,
    ) -> StoreResult<Self> {
        debug_assert_eq!(base as usize % CHUNK_SIZE, 0);
        let mut files = Vec::new();
        let mut total = 0usize;

        loop {
            let path = segment_file_path(dir, files.len());
            if !path.exists() {
                break;
            }
            let file = if read_only {
                File::open(&path)?
            } else {
                OpenOptions::new().read(true).write(true).open(&path)?
            };
            let len = file.metadata()?.len() as usize;
            if len == 0 || len % CHUNK_SIZE != 0 || len > SEGMENT_FILE_SIZE {
                return Err(StoreError::corrupted(format!(
                    "segment file {} has invalid length {}",
                    path.display(),
                    len
                )));
            }
            if total + len > vm_capacity {
                return Err(StoreError::InvalidConfiguration(format!(
                    "segment size {} exceeds reservation capacity {}",
                    total + len,
                    vm_capacity
                )));
            }
            // SAFETY: the target range lies inside the caller's reservation.
            unsafe {
                os::map_file_fixed(
                    base.add(total),
                    len,
                    file.as_raw_fd(),
                    0,
                    !read_only,
                )?;
            }
            total += len;
            let full = len == SEGMENT_FILE_SIZE;
            files.push(file);
            if !full {
                break;
            }
        }

        info!(
            "segment opened at {:p} ({} bytes in {} files, read_only={})",
            base,
            total,
            files.len(),
            read_only
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            base,
            vm_capacity,
            current_size: total,
            files,
            read_only,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn vm_capacity(&self) -> usize {
        self.vm_capacity
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Grow the live portion to at least `new_size` bytes (a chunk multiple).
    ///
    /// No-op when already large enough. Returns `false` when growth would
    /// exceed the reservation or the disk is full; real mapping errors
    /// propagate.
    pub fn extend(&mut self, new_size: usize) -> StoreResult<bool> {
        debug_assert_eq!(new_size % CHUNK_SIZE, 0);
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if new_size <= self.current_size {
            return Ok(true);
        }
        if new_size > self.vm_capacity {
            debug!(
                "extend to {} rejected: capacity {}",
                new_size, self.vm_capacity
            );
            return Ok(false);
        }

        while self.current_size < new_size {
            let file_index = self.current_size / SEGMENT_FILE_SIZE;
            let file_start = file_index * SEGMENT_FILE_SIZE;
            let len_in_file = self.current_size - file_start;
            let target_in_file = (new_size - file_start).min(SEGMENT_FILE_SIZE);

            if self.files.len() <= file_index {
                let path = segment_file_path(&self.dir, file_index);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                self.files.push(file);
            }
            let file = &self.files[file_index];

            if let Err(e) = file.set_len(target_in_file as u64) {
                warn!("segment file extension failed: {}", e);
                return Ok(false);
            }

            let delta = target_in_file - len_in_file;
            // SAFETY: the new range lies inside the reservation; the file
            // now covers it.
            unsafe {
                os::map_file_fixed(
                    self.base.add(self.current_size),
                    delta,
                    file.as_raw_fd(),
                    len_in_file,
                    true,
                )?;
            }
            self.current_size += delta;
        }

        debug!("segment extended to {} bytes", self.current_size);
        Ok(true)
    }

    /// Flush dirty pages back to the backing files.
    pub fn sync(&self, synchronous: bool) -> StoreResult<()> {
        if self.current_size == 0 {
            return Ok(());
        }
        // SAFETY: [base, current_size) is a live mapping owned here.
        unsafe {
            os::sync_mapping(self.base, self.current_size, synchronous)?;
        }
        if synchronous {
            for file in &self.files {
                os::fsync_file(file)?;
            }
        }
        Ok(())
    }

    /// Unmap the segment and close the backing files. Deletes nothing.
    pub fn destroy(&mut self) -> StoreResult<()> {
        if self.current_size > 0 {
            // SAFETY: unmapping the range this storage mapped.
            unsafe {
                os::unmap(self.base, self.current_size)?;
            }
        }
        self.current_size = 0;
        self.files.clear();
        Ok(())
    }
}
