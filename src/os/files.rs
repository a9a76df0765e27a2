/*!
 * Filesystem Primitives
 * Directory management, durable writes, and file cloning with a
 * reflink-first strategy
 */

use crate::core::{StoreError, StoreResult};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

/// FICLONE ioctl request (linux): clone the whole source file into the
/// destination, sharing extents on filesystems that support reflink.
#[cfg(target_os = "linux")]
const FICLONE: u32 = 0x4004_9409;

pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Create a directory and any missing parents
pub fn create_directory(path: &Path) -> StoreResult<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Remove a directory tree; absent paths are not an error
pub fn remove_recursive(path: &Path) -> StoreResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Remove a single file; absent paths are not an error
pub fn remove_file(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Flush a file's data and metadata to stable storage
pub fn fsync_file(file: &File) -> StoreResult<()> {
    file.sync_all()?;
    Ok(())
}

/// Flush directory metadata so freshly created entries survive a crash
pub fn fsync_directory(path: &Path) -> StoreResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Write `data` to `path` and fsync it before returning
pub fn write_durable(path: &Path, data: &[u8]) -> StoreResult<()> {
    use std::io::Write;
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Clone `src` to `dst`.
///
/// Tries a copy-on-write reflink first when `prefer_reflink` is set and the
/// platform supports it, then falls back to a streaming copy. The
/// destination is fsync'd either way.
pub fn clone_file(src: &Path, dst: &Path, prefer_reflink: bool) -> StoreResult<()> {
    if prefer_reflink && try_reflink(src, dst)? {
        debug!("reflinked {} -> {}", src.display(), dst.display());
    } else {
        fs::copy(src, dst)?;
        debug!("copied {} -> {}", src.display(), dst.display());
    }
    let out = File::open(dst)?;
    out.sync_all()?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn try_reflink(src: &Path, dst: &Path) -> StoreResult<bool> {
    let src_file = File::open(src)?;
    let dst_file = File::create(dst)?;
    // SAFETY: both descriptors are valid for the duration of the call.
    let rc = unsafe {
        nix::libc::ioctl(
            dst_file.as_raw_fd(),
            FICLONE as _,
            src_file.as_raw_fd(),
        )
    };
    if rc == 0 {
        Ok(true)
    } else {
        // EOPNOTSUPP / EXDEV and friends: the filesystem cannot reflink.
        let _ = fs::remove_file(dst);
        Ok(false)
    }
}

#[cfg(not(target_os = "linux"))]
fn try_reflink(_src: &Path, _dst: &Path) -> StoreResult<bool> {
    Ok(false)
}

/// Resolve a caller thread budget: non-positive picks from hardware
/// concurrency, and the result never exceeds the number of jobs.
pub fn num_copy_threads(budget: i32, jobs: usize) -> usize {
    let chosen = if budget <= 0 {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    } else {
        budget as usize
    };
    chosen.clamp(1, jobs.max(1))
}

/// Copy a set of files with up to `max_threads` workers (<= 0 auto-picks).
///
/// Workers pull jobs from a shared index; the first failure wins and is
/// returned after all workers drain.
pub fn copy_files(
    jobs: Vec<(PathBuf, PathBuf)>,
    prefer_reflink: bool,
    max_threads: i32,
) -> StoreResult<()> {
    if jobs.is_empty() {
        return Ok(());
    }
    let workers = num_copy_threads(max_threads, jobs.len());
    if workers <= 1 {
        for (src, dst) in &jobs {
            clone_file(src, dst, prefer_reflink)?;
        }
        return Ok(());
    }

    debug!("copying {} files with {} workers", jobs.len(), workers);
    let next = AtomicUsize::new(0);
    let failure: Mutex<Option<StoreError>> = Mutex::new(None);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= jobs.len() || failure.lock().is_some() {
                    break;
                }
                let (src, dst) = &jobs[i];
                if let Err(e) = clone_file(src, dst, prefer_reflink) {
                    warn!("copy worker failed on {}: {}", src.display(), e);
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    break;
                }
            });
        }
    });
    match failure.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
