/*!
 * Datastore Cloning
 * Snapshot/copy file plumbing and async operation handles
 */

use crate::core::{StoreError, StoreResult};
use crate::os;
use log::info;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// Name of the datastore subdirectory under a base path
pub const DATASTORE_DIR: &str = "datastore";

/// Zero-byte sentinel whose presence marks a cleanly closed store.
/// Lives next to `datastore/`, not inside it, so wiping the datastore
/// during a recreate does not drop it prematurely.
pub const MARKER_FILE: &str = "properly_closed";

pub fn datastore_dir(base: &Path) -> PathBuf {
    base.join(DATASTORE_DIR)
}

pub fn marker_path(base: &Path) -> PathBuf {
    base.join(MARKER_FILE)
}

/// Write the properly-closed marker and flush the directory entry.
/// Must be the very last action of a clean shutdown.
pub fn write_marker(base: &Path) -> StoreResult<()> {
    os::write_durable(&marker_path(base), b"")?;
    os::fsync_directory(base)
}

pub fn remove_marker(base: &Path) -> StoreResult<()> {
    os::remove_file(&marker_path(base))
}

pub fn marker_exists(base: &Path) -> bool {
    os::file_exists(&marker_path(base))
}

/// Clone `src/datastore` into `dst/datastore`, reflinking when the
/// filesystem supports it, with up to `max_threads` copy workers
/// (non-positive auto-picks).
pub fn clone_datastore(
    src_base: &Path,
    dst_base: &Path,
    prefer_reflink: bool,
    max_threads: i32,
) -> StoreResult<()> {
    let src_dir = datastore_dir(src_base);
    let dst_dir = datastore_dir(dst_base);
    if !src_dir.is_dir() {
        return Err(StoreError::invalid_argument(format!(
            "{} holds no datastore",
            src_base.display()
        )));
    }
    os::create_directory(&dst_dir)?;

    let mut jobs = Vec::new();
    for dirent in std::fs::read_dir(&src_dir)? {
        let dirent = dirent?;
        if dirent.file_type()?.is_file() {
            jobs.push((dirent.path(), dst_dir.join(dirent.file_name())));
        }
    }
    let n_files = jobs.len();
    os::copy_files(jobs, prefer_reflink, max_threads)?;
    os::fsync_directory(&dst_dir)?;
    info!(
        "cloned datastore {} -> {} ({} files)",
        src_base.display(),
        dst_base.display(),
        n_files
    );
    Ok(())
}

/// Handle to a snapshot/copy/remove running on a background thread.
/// Identical semantics to the synchronous form; the work always runs to
/// completion.
pub struct AsyncOp {
    handle: JoinHandle<StoreResult<()>>,
}

impl AsyncOp {
    pub(crate) fn spawn<F>(op: F) -> Self
    where
        F: FnOnce() -> StoreResult<()> + Send + 'static,
    {
        Self {
            handle: thread::spawn(op),
        }
    }

    /// Poll without blocking
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the operation completes and return its result
    pub fn wait(self) -> StoreResult<()> {
        self.handle
            .join()
            .map_err(|_| StoreError::corrupted("async datastore operation panicked"))?
    }
}
