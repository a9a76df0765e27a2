/*!
 * Virtual Memory Primitives
 * Aligned reservations and fixed-address mappings over the libc mmap family
 */

use crate::core::{StoreError, StoreResult};
use nix::libc;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// OS page size in bytes
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Reserve `size` bytes of virtual address space aligned to `align`,
/// without committing any physical memory.
///
/// The technique over-maps by `align`, then trims the misaligned head and
/// tail, so the remaining reservation is exactly `(base, size)` and can be
/// released by a single `unmap(base, size)`.
pub fn reserve_aligned(align: usize, size: usize) -> StoreResult<*mut u8> {
    debug_assert!(align.is_power_of_two());
    let span = size + align;
    // SAFETY: anonymous PROT_NONE mapping at a kernel-chosen address.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            span,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }

    let addr = raw as usize;
    let base = (addr + align - 1) & !(align - 1);
    let lead = base - addr;
    let tail = span - lead - size;
    // SAFETY: both ranges lie inside the mapping created above.
    unsafe {
        if lead > 0 {
            libc::munmap(raw, lead);
        }
        if tail > 0 {
            libc::munmap((base + size) as *mut libc::c_void, tail);
        }
    }
    Ok(base as *mut u8)
}

/// Map `size` bytes of zeroed anonymous memory at exactly `addr`.
///
/// # Safety
/// `addr..addr+size` must lie inside a reservation owned by the caller;
/// the mapping replaces whatever was there.
pub unsafe fn map_anonymous_fixed(addr: *mut u8, size: usize) -> StoreResult<()> {
    let mapped = libc::mmap(
        addr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    if mapped == libc::MAP_FAILED {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Map `size` bytes of `fd` starting at `file_offset` at exactly `addr`,
/// shared so that stores reach the backing file.
///
/// # Safety
/// Same reservation requirement as [`map_anonymous_fixed`]; `fd` must stay
/// open for the lifetime of the mapping (the kernel keeps its own reference,
/// but the caller owns consistency).
pub unsafe fn map_file_fixed(
    addr: *mut u8,
    size: usize,
    fd: RawFd,
    file_offset: usize,
    writable: bool,
) -> StoreResult<()> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let mapped = libc::mmap(
        addr as *mut libc::c_void,
        size,
        prot,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        file_offset as libc::off_t,
    );
    if mapped == libc::MAP_FAILED {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Release a mapping or reservation.
///
/// # Safety
/// `addr..addr+size` must be a range previously obtained from this module
/// and not referenced afterwards.
pub unsafe fn unmap(addr: *mut u8, size: usize) -> StoreResult<()> {
    if size == 0 {
        return Ok(());
    }
    if libc::munmap(addr as *mut libc::c_void, size) != 0 {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Flush dirty pages of a mapped range back to the backing file.
///
/// Blocks until the write-out completes when `synchronous` is set.
///
/// # Safety
/// `addr..addr+size` must be a live mapping.
pub unsafe fn sync_mapping(addr: *mut u8, size: usize, synchronous: bool) -> StoreResult<()> {
    if size == 0 {
        return Ok(());
    }
    let flags = if synchronous {
        libc::MS_SYNC
    } else {
        libc::MS_ASYNC
    };
    if libc::msync(addr as *mut libc::c_void, size, flags) != 0 {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }
    Ok(())
}
