/*!
 * Manager Kernel
 *
 * Orchestrates the datastore lifecycle: create/open/close with
 * crash-consistency marking, typed construct/find/destroy over the segment
 * allocator and the object directory, flushing, snapshot/copy/remove, and
 * offline attribute access.
 *
 * ## Consistency protocol
 *
 * A zero-byte `properly_closed` marker next to `datastore/` is present
 * exactly when the last session shut down cleanly. `create` and a writable
 * `open` remove it up front; `close` serializes all management data, syncs
 * the segment, and writes the marker as its very last action. A crash in
 * between leaves the store marked inconsistent and `open` refuses it.
 */

mod header;
mod snapshot;

pub use header::SegmentHeader;
pub use snapshot::AsyncOp;

use crate::alloc::SegmentAllocator;
use crate::core::types::{round_up, Offset, StoreStats, CHUNK_SIZE, DEFAULT_CAPACITY,
    MAX_SEGMENT_SIZE, STORE_VERSION};
use crate::core::{StoreError, StoreResult};
use crate::directory::{ObjectDirectory, ObjectEntry, ObjectKind};
use crate::os;
use crate::segment::SegmentStorage;
use log::{error, info, warn};
use snapshot::{clone_datastore, datastore_dir, marker_exists, remove_marker, write_marker};
use std::any::type_name;
use std::fs;
use std::mem::{align_of, size_of};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const NAMED_DIRECTORY_FILE: &str = "named_directory";
const ALLOCATOR_STATE_FILE: &str = "allocator_state";
const UUID_FILE: &str = "uuid";
const DESCRIPTION_FILE: &str = "description";
const VERSION_FILE: &str = "version";

/// Unmaps a fresh reservation unless attach completes
struct RegionGuard {
    base: *mut u8,
    len: usize,
    armed: bool,
}

impl RegionGuard {
    fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len,
            armed: true,
        }
    }

    fn release(mut self) -> *mut u8 {
        self.armed = false;
        self.base
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: the reservation was obtained from reserve_aligned and
            // nothing else references it yet.
            if let Err(e) = unsafe { os::unmap(self.base, self.len) } {
                warn!("failed to release reservation: {}", e);
            }
        }
    }
}

/// Persistent heap manager.
///
/// One instance owns one attached datastore. Allocation, construction, and
/// destruction are thread-safe against each other; `close` is idempotent
/// and also runs on drop.
pub struct StoreManager {
    base_path: PathBuf,
    uuid: String,
    read_only: bool,
    region_base: *mut u8,
    region_len: usize,
    // Boxed so the segment header's self-pointer stays valid when the
    // manager itself moves.
    allocator: Box<SegmentAllocator>,
    directory: ObjectDirectory,
    attached: bool,
}

// SAFETY: the raw region pointer is fixed after attach; all shared mutable
// state lives behind the allocator mutex and the directory's sharded maps.
unsafe impl Send for StoreManager {}
unsafe impl Sync for StoreManager {}

impl StoreManager {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a fresh datastore under `base`, wiping any previous one
    pub fn create(base: &Path) -> StoreResult<Self> {
        Self::create_with_capacity(base, DEFAULT_CAPACITY)
    }

    /// Create with an explicit VM reservation bound (rounded up to a whole
    /// number of chunks)
    pub fn create_with_capacity(base: &Path, capacity: usize) -> StoreResult<Self> {
        Self::validate_config(capacity)?;
        let capacity = round_up(capacity, CHUNK_SIZE);

        os::create_directory(base)?;
        let store_dir = datastore_dir(base);
        // A failed wipe fails the create; continuing would mix two stores.
        os::remove_recursive(&store_dir)?;
        os::create_directory(&store_dir)?;
        // A crash from here on leaves the store marked inconsistent.
        remove_marker(base)?;
        os::fsync_directory(base)?;

        let region_len = CHUNK_SIZE + capacity;
        let guard = RegionGuard::new(os::reserve_aligned(CHUNK_SIZE, region_len)?, region_len);
        // SAFETY: the header chunk is the front of our own reservation.
        unsafe { os::map_anonymous_fixed(guard.base, CHUNK_SIZE)? };
        let segment_base = unsafe { guard.base.add(CHUNK_SIZE) };

        let storage = SegmentStorage::create(&store_dir, segment_base, capacity);
        let allocator = Box::new(SegmentAllocator::create(storage));
        // SAFETY: header chunk mapped above; the allocator box outlives it.
        unsafe { SegmentHeader::install(guard.base, &*allocator) };

        let uuid = Uuid::new_v4().to_string();
        os::write_durable(&store_dir.join(UUID_FILE), uuid.as_bytes())?;
        os::write_durable(&store_dir.join(VERSION_FILE), &STORE_VERSION.to_le_bytes())?;

        info!(
            "created datastore at {} (uuid {}, capacity {} bytes)",
            base.display(),
            uuid,
            capacity
        );
        Ok(Self {
            base_path: base.to_path_buf(),
            uuid,
            read_only: false,
            region_base: guard.release(),
            region_len,
            allocator,
            directory: ObjectDirectory::new(),
            attached: true,
        })
    }

    /// Attach an existing, cleanly closed datastore for writing
    pub fn open(base: &Path) -> StoreResult<Self> {
        Self::open_impl(base, false)
    }

    /// Attach an existing datastore without the right to mutate it
    pub fn open_read_only(base: &Path) -> StoreResult<Self> {
        Self::open_impl(base, true)
    }

    fn open_impl(base: &Path, read_only: bool) -> StoreResult<Self> {
        if !marker_exists(base) {
            return Err(StoreError::Inconsistent {
                path: base.to_path_buf(),
            });
        }
        let store_dir = datastore_dir(base);
        let existing = Self::existing_segment_size(&store_dir)?;
        let capacity = round_up(existing.max(DEFAULT_CAPACITY), CHUNK_SIZE);
        Self::validate_config(capacity)?;

        let region_len = CHUNK_SIZE + capacity;
        let guard = RegionGuard::new(os::reserve_aligned(CHUNK_SIZE, region_len)?, region_len);
        // SAFETY: the header chunk is the front of our own reservation.
        unsafe { os::map_anonymous_fixed(guard.base, CHUNK_SIZE)? };
        let segment_base = unsafe { guard.base.add(CHUNK_SIZE) };

        let storage = SegmentStorage::open(&store_dir, segment_base, capacity, read_only)?;
        let allocator = Box::new(SegmentAllocator::open(
            storage,
            &store_dir.join(ALLOCATOR_STATE_FILE),
        )?);
        // SAFETY: header chunk mapped above; the allocator box outlives it.
        unsafe { SegmentHeader::install(guard.base, &*allocator) };

        let directory = ObjectDirectory::deserialize(&store_dir.join(NAMED_DIRECTORY_FILE))?;
        let uuid = Self::get_uuid(base)?;

        if !read_only {
            // A crash before the next close must be detectable.
            remove_marker(base)?;
            os::fsync_directory(base)?;
        }

        info!(
            "opened datastore at {} (uuid {}, {} objects, read_only={})",
            base.display(),
            uuid,
            directory.len(),
            read_only
        );
        Ok(Self {
            base_path: base.to_path_buf(),
            uuid,
            read_only,
            region_base: guard.release(),
            region_len,
            allocator,
            directory,
            attached: true,
        })
    }

    /// Detach cleanly: serialize management data, flush the segment, and
    /// write the properly-closed marker as the very last action.
    /// Idempotent; the second call is a no-op.
    pub fn close(&mut self) -> StoreResult<()> {
        if !self.attached {
            return Ok(());
        }
        let store_dir = datastore_dir(&self.base_path);
        if !self.read_only {
            self.directory
                .serialize(&store_dir.join(NAMED_DIRECTORY_FILE))?;
            self.allocator
                .serialize(&store_dir.join(ALLOCATOR_STATE_FILE))?;
            self.allocator.sync(true)?;
        }
        self.allocator.shutdown()?;
        // SAFETY: this reservation belongs to us and is referenced nowhere
        // else once the storage is unmapped.
        unsafe { os::unmap(self.region_base, self.region_len)? };
        self.attached = false;

        if !self.read_only {
            os::fsync_directory(&store_dir)?;
            write_marker(&self.base_path)?;
        }
        info!("closed datastore at {}", self.base_path.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw memory
    // ------------------------------------------------------------------

    /// Allocate raw bytes from the segment
    pub fn allocate(&self, nbytes: usize) -> StoreResult<*mut u8> {
        self.ensure_attached()?;
        let offset = self.allocator.allocate(nbytes)?;
        Ok(self.resolve::<u8>(offset))
    }

    /// Allocate raw bytes at an address divisible by `align`
    pub fn allocate_aligned(&self, nbytes: usize, align: usize) -> StoreResult<*mut u8> {
        self.ensure_attached()?;
        let offset = self.allocator.allocate_aligned(nbytes, align)?;
        Ok(self.resolve::<u8>(offset))
    }

    /// Release a raw allocation by its head address
    pub fn deallocate(&self, addr: *mut u8) -> StoreResult<()> {
        self.ensure_attached()?;
        let offset = self.offset_of(addr)?;
        self.allocator.deallocate(offset)
    }

    /// True when no allocation is live. Expensive: scans the whole chunk
    /// directory.
    pub fn all_memory_deallocated(&self) -> bool {
        self.attached && self.allocator.all_deallocated()
    }

    // ------------------------------------------------------------------
    // Typed construction protocol
    // ------------------------------------------------------------------

    /// Construct `count` elements under a user-supplied name.
    /// `init` is called per element in index order; on failure the already
    /// initialized prefix is dropped in reverse and the memory released.
    pub fn construct<T: 'static, F>(&self, name: &str, count: usize, init: F) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.construct_impl(ObjectKind::Named, Some(name), count, false, init)
    }

    /// Construct under a name, or return the existing instance unchanged
    /// (the found entry wins; `init` does not run for it)
    pub fn find_or_construct<T: 'static, F>(
        &self,
        name: &str,
        count: usize,
        init: F,
    ) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.construct_impl(ObjectKind::Named, Some(name), count, true, init)
    }

    /// Construct the per-type singleton instance
    pub fn construct_unique<T: 'static, F>(&self, count: usize, init: F) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.construct_impl(ObjectKind::Unique, None, count, false, init)
    }

    /// Construct or fetch the per-type singleton instance
    pub fn find_or_construct_unique<T: 'static, F>(
        &self,
        count: usize,
        init: F,
    ) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.construct_impl(ObjectKind::Unique, None, count, true, init)
    }

    /// Construct an unnamed instance, reachable only by address
    pub fn construct_anonymous<T: 'static, F>(&self, count: usize, init: F) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.construct_impl(ObjectKind::Anonymous, None, count, false, init)
    }

    fn construct_impl<T: 'static, F>(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
        count: usize,
        find_or_create: bool,
        mut init: F,
    ) -> StoreResult<*mut T>
    where
        F: FnMut(usize) -> Result<T, StoreError>,
    {
        self.ensure_attached()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if count == 0 {
            return Err(StoreError::invalid_argument("zero-length construction"));
        }
        if size_of::<T>() == 0 {
            return Err(StoreError::invalid_argument("zero-sized element type"));
        }
        let bytes = count
            .checked_mul(size_of::<T>())
            .ok_or_else(|| StoreError::invalid_argument("construction size overflows"))?;
        let token = type_name::<T>();
        let key = match kind {
            ObjectKind::Named => {
                let name = name.unwrap_or_default();
                if name.is_empty() {
                    return Err(StoreError::invalid_argument("empty instance name"));
                }
                name.to_string()
            }
            ObjectKind::Unique => token.to_string(),
            ObjectKind::Anonymous => String::new(),
        };

        if kind != ObjectKind::Anonymous {
            if let Some(existing) = self.directory.find(kind, &key) {
                return if find_or_create {
                    self.typed_address::<T>(&existing)
                } else {
                    Err(StoreError::NameInUse(key))
                };
            }
        }

        let offset = self.allocator.allocate_aligned(bytes, align_of::<T>())?;

        if kind != ObjectKind::Anonymous {
            let entry = ObjectEntry::new(key.clone(), token, kind, offset, count as u64);
            if let Err(existing) = self.directory.insert_if_absent(entry) {
                // A racing construct won the name; give our memory back.
                self.allocator.deallocate(offset)?;
                return if find_or_create {
                    self.typed_address::<T>(&existing)
                } else {
                    Err(StoreError::NameInUse(key))
                };
            }
        }

        let ptr = self.resolve::<T>(offset);
        if let Err(e) = run_init(ptr, count, &mut init) {
            if kind != ObjectKind::Anonymous {
                self.directory.erase(kind, &key);
            }
            if let Err(rollback) = self.allocator.deallocate(offset) {
                warn!("rollback deallocation failed: {}", rollback);
            }
            return Err(e);
        }

        if kind == ObjectKind::Anonymous {
            // Address-keyed bookkeeping so destroy-by-pointer and iteration
            // cover anonymous instances.
            let entry = ObjectEntry::new("", token, kind, offset, count as u64);
            if self.directory.insert_if_absent(entry).is_err() {
                warn!("anonymous bookkeeping already held offset {}", offset);
            }
        }
        Ok(ptr)
    }

    /// Look up a named instance; `None` when absent or of another type
    pub fn find<T: 'static>(&self, name: &str) -> Option<(*mut T, u64)> {
        self.find_keyed::<T>(ObjectKind::Named, name)
    }

    /// Look up the per-type singleton instance
    pub fn find_unique<T: 'static>(&self) -> Option<(*mut T, u64)> {
        self.find_keyed::<T>(ObjectKind::Unique, type_name::<T>())
    }

    fn find_keyed<T: 'static>(&self, kind: ObjectKind, key: &str) -> Option<(*mut T, u64)> {
        if self.ensure_attached().is_err() {
            return None;
        }
        let entry = self.directory.find(kind, key)?;
        (entry.type_id == type_name::<T>())
            .then(|| (self.resolve::<T>(entry.offset), entry.length))
    }

    /// Destroy a named instance; `Ok(false)` when no such name exists
    pub fn destroy<T: 'static>(&self, name: &str) -> StoreResult<bool> {
        self.destroy_keyed::<T>(ObjectKind::Named, name)
    }

    /// Destroy the per-type singleton instance
    pub fn destroy_unique<T: 'static>(&self) -> StoreResult<bool> {
        self.destroy_keyed::<T>(ObjectKind::Unique, type_name::<T>())
    }

    fn destroy_keyed<T: 'static>(&self, kind: ObjectKind, key: &str) -> StoreResult<bool> {
        self.ensure_attached()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let found = match self.directory.find(kind, key) {
            Some(found) => found,
            None => return Ok(false),
        };
        if found.type_id != type_name::<T>() {
            return Err(StoreError::invalid_argument(format!(
                "'{}' holds a {} instance, not {}",
                key,
                found.type_id,
                type_name::<T>()
            )));
        }
        // Entry out first: a failing destructor can then only leak, never
        // double-free.
        let entry = match self.directory.erase(kind, key) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        self.release_object::<T>(&entry)?;
        Ok(true)
    }

    /// Destroy an instance by its address. Raw allocations (no directory
    /// entry) are released without running destructors.
    pub fn destroy_ptr<T: 'static>(&self, ptr: *const T) -> StoreResult<bool> {
        self.ensure_attached()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let offset = self.offset_of(ptr as *const u8)?;
        // Rejects interior and foreign pointers before anything is touched.
        self.allocator.block_len(offset)?;
        match self.directory.find_by_offset(offset) {
            Some(found) => {
                if found.type_id != type_name::<T>() {
                    return Err(StoreError::invalid_argument(format!(
                        "address holds a {} instance, not {}",
                        found.type_id,
                        type_name::<T>()
                    )));
                }
                let entry = match self.directory.erase_by_offset(offset) {
                    Some(entry) => entry,
                    None => return Ok(false),
                };
                self.release_object::<T>(&entry)?;
            }
            None => self.allocator.deallocate(offset)?,
        }
        Ok(true)
    }

    fn release_object<T>(&self, entry: &ObjectEntry) -> StoreResult<()> {
        let ptr = self.resolve::<T>(entry.offset);
        for index in 0..entry.length as usize {
            let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
                std::ptr::drop_in_place(ptr.add(index))
            }));
            if outcome.is_err() {
                // Deliberate leak: the entry is gone, the heap stays sound.
                error!(
                    "destructor panicked for {} instance '{}' element {}; leaking the allocation",
                    entry.kind, entry.name, index
                );
                return Ok(());
            }
        }
        self.allocator.deallocate(entry.offset)
    }

    // ------------------------------------------------------------------
    // Instance attributes and iteration
    // ------------------------------------------------------------------

    /// Directory entry for the object whose allocation head is `ptr`
    pub fn instance_entry<T>(&self, ptr: *const T) -> Option<ObjectEntry> {
        if self.ensure_attached().is_err() {
            return None;
        }
        let offset = self.offset_of(ptr as *const u8).ok()?;
        self.directory.find_by_offset(offset)
    }

    pub fn instance_name<T>(&self, ptr: *const T) -> Option<String> {
        self.instance_entry(ptr).map(|e| e.name)
    }

    pub fn instance_kind<T>(&self, ptr: *const T) -> Option<ObjectKind> {
        self.instance_entry(ptr).map(|e| e.kind)
    }

    /// Element count of the instance at `ptr`
    pub fn instance_length<T>(&self, ptr: *const T) -> Option<u64> {
        self.instance_entry(ptr).map(|e| e.length)
    }

    pub fn instance_description<T>(&self, ptr: *const T) -> Option<String> {
        self.instance_entry(ptr).map(|e| e.description)
    }

    /// Whether the instance at `ptr` was constructed as a `T`
    pub fn is_instance_of<T: 'static>(&self, ptr: *const T) -> bool {
        self.instance_entry(ptr)
            .is_some_and(|e| e.type_id == type_name::<T>())
    }

    /// Attach a description to the instance at `ptr`
    pub fn set_instance_description<T>(&self, ptr: *const T, text: &str) -> bool {
        if self.read_only {
            return false;
        }
        match self.instance_entry(ptr) {
            Some(entry) => self.directory.set_description(&entry, text),
            None => false,
        }
    }

    /// Snapshot of the named directory. Not invalidated by later mutation,
    /// but also not reflecting it.
    pub fn named_entries(&self) -> Vec<ObjectEntry> {
        self.directory.list(ObjectKind::Named)
    }

    pub fn unique_entries(&self) -> Vec<ObjectEntry> {
        self.directory.list(ObjectKind::Unique)
    }

    pub fn anonymous_entries(&self) -> Vec<ObjectEntry> {
        self.directory.list(ObjectKind::Anonymous)
    }

    // ------------------------------------------------------------------
    // Flushing, snapshotting, store attributes
    // ------------------------------------------------------------------

    /// Flush dirty segment pages; blocks when `synchronous`
    pub fn flush(&self, synchronous: bool) -> StoreResult<()> {
        self.ensure_attached()?;
        if self.read_only {
            return Ok(());
        }
        self.allocator.sync(synchronous)
    }

    /// Clone the live datastore to `dst` as an independently openable store
    /// with a fresh identity. The source is left cleanly persisted too.
    pub fn snapshot(&self, dst: &Path, prefer_reflink: bool, max_threads: i32) -> StoreResult<()> {
        self.persist_management_data()?;
        os::create_directory(dst)?;
        clone_datastore(&self.base_path, dst, prefer_reflink, max_threads)?;
        let snapshot_uuid = Uuid::new_v4().to_string();
        os::write_durable(
            &datastore_dir(dst).join(UUID_FILE),
            snapshot_uuid.as_bytes(),
        )?;
        write_marker(dst)?;
        info!(
            "snapshot {} -> {} (uuid {})",
            self.base_path.display(),
            dst.display(),
            snapshot_uuid
        );
        Ok(())
    }

    /// Like [`snapshot`](Self::snapshot) with the file copying moved off the
    /// caller's thread; management data is persisted before returning
    pub fn snapshot_async(
        &self,
        dst: &Path,
        prefer_reflink: bool,
        max_threads: i32,
    ) -> StoreResult<AsyncOp> {
        self.persist_management_data()?;
        let src = self.base_path.clone();
        let dst = dst.to_path_buf();
        Ok(AsyncOp::spawn(move || {
            os::create_directory(&dst)?;
            clone_datastore(&src, &dst, prefer_reflink, max_threads)?;
            let snapshot_uuid = Uuid::new_v4().to_string();
            os::write_durable(
                &datastore_dir(&dst).join(UUID_FILE),
                snapshot_uuid.as_bytes(),
            )?;
            write_marker(&dst)
        }))
    }

    fn persist_management_data(&self) -> StoreResult<()> {
        self.ensure_attached()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let store_dir = datastore_dir(&self.base_path);
        self.directory
            .serialize(&store_dir.join(NAMED_DIRECTORY_FILE))?;
        self.allocator
            .serialize(&store_dir.join(ALLOCATOR_STATE_FILE))?;
        self.allocator.sync(true)
    }

    pub fn stats(&self) -> StoreStats {
        self.allocator.stats()
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Version stamp of the attached store
    pub fn version(&self) -> StoreResult<u32> {
        Self::get_version(&self.base_path)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn segment_base(&self) -> *mut u8 {
        self.allocator.base()
    }

    pub fn segment_size(&self) -> usize {
        self.allocator.current_size()
    }

    /// Coarse allocation unit, fixed at compile time
    pub const fn chunk_size() -> usize {
        CHUNK_SIZE
    }

    /// Set the store-level description text
    pub fn set_description(&self, text: &str) -> StoreResult<()> {
        self.ensure_attached()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Self::set_description_at(&self.base_path, text)
    }

    /// Store-level description text, if any
    pub fn description(&self) -> StoreResult<Option<String>> {
        Self::get_description(&self.base_path)
    }

    // ------------------------------------------------------------------
    // Static datastore utilities
    // ------------------------------------------------------------------

    /// Whether the store at `base` was closed cleanly
    pub fn consistent(base: &Path) -> bool {
        marker_exists(base)
    }

    /// Delete the datastore and its marker; other files under `base` stay
    pub fn remove(base: &Path) -> StoreResult<()> {
        os::remove_recursive(&datastore_dir(base))?;
        remove_marker(base)?;
        info!("removed datastore at {}", base.display());
        Ok(())
    }

    pub fn remove_async(base: &Path) -> AsyncOp {
        let base = base.to_path_buf();
        AsyncOp::spawn(move || Self::remove(&base))
    }

    /// Clone a closed, consistent store; the UUID is preserved
    pub fn copy(
        src: &Path,
        dst: &Path,
        prefer_reflink: bool,
        max_threads: i32,
    ) -> StoreResult<()> {
        if !marker_exists(src) {
            return Err(StoreError::Inconsistent {
                path: src.to_path_buf(),
            });
        }
        os::create_directory(dst)?;
        clone_datastore(src, dst, prefer_reflink, max_threads)?;
        write_marker(dst)
    }

    pub fn copy_async(
        src: &Path,
        dst: &Path,
        prefer_reflink: bool,
        max_threads: i32,
    ) -> AsyncOp {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        AsyncOp::spawn(move || Self::copy(&src, &dst, prefer_reflink, max_threads))
    }

    /// UUID of the store at `base`; empty when the file is missing
    pub fn get_uuid(base: &Path) -> StoreResult<String> {
        let path = datastore_dir(base).join(UUID_FILE);
        if !path.exists() {
            return Ok(String::new());
        }
        let raw = fs::read(path)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Version stamp written at create time; 0 when missing
    pub fn get_version(base: &Path) -> StoreResult<u32> {
        let path = datastore_dir(base).join(VERSION_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read(path)?;
        if raw.len() != 4 {
            return Err(StoreError::corrupted("version file is malformed"));
        }
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Store-level description of the store at `base`
    pub fn get_description(base: &Path) -> StoreResult<Option<String>> {
        let path = datastore_dir(base).join(DESCRIPTION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Set the store-level description of a (possibly closed) store
    pub fn set_description_at(base: &Path, text: &str) -> StoreResult<()> {
        os::write_durable(
            &datastore_dir(base).join(DESCRIPTION_FILE),
            text.as_bytes(),
        )
    }

    /// Named entries of a closed store, read without attaching the segment
    pub fn named_attributes(base: &Path) -> StoreResult<Vec<ObjectEntry>> {
        Self::offline_attributes(base, ObjectKind::Named)
    }

    pub fn unique_attributes(base: &Path) -> StoreResult<Vec<ObjectEntry>> {
        Self::offline_attributes(base, ObjectKind::Unique)
    }

    pub fn anonymous_attributes(base: &Path) -> StoreResult<Vec<ObjectEntry>> {
        Self::offline_attributes(base, ObjectKind::Anonymous)
    }

    fn offline_attributes(base: &Path, kind: ObjectKind) -> StoreResult<Vec<ObjectEntry>> {
        let directory =
            ObjectDirectory::deserialize(&datastore_dir(base).join(NAMED_DIRECTORY_FILE))?;
        Ok(directory.list(kind))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn validate_config(capacity: usize) -> StoreResult<()> {
        let page = os::page_size();
        if CHUNK_SIZE % page != 0 {
            return Err(StoreError::InvalidConfiguration(format!(
                "chunk size {} is not a multiple of the page size {}",
                CHUNK_SIZE, page
            )));
        }
        if capacity < CHUNK_SIZE || capacity > MAX_SEGMENT_SIZE {
            return Err(StoreError::InvalidConfiguration(format!(
                "capacity {} outside [{}, {}]",
                capacity, CHUNK_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        Ok(())
    }

    fn existing_segment_size(store_dir: &Path) -> StoreResult<usize> {
        let mut total = 0usize;
        let mut index = 0usize;
        loop {
            let path = store_dir.join(format!("segment.{}", index));
            if !path.exists() {
                break;
            }
            total += fs::metadata(&path)?.len() as usize;
            index += 1;
        }
        Ok(total)
    }

    fn ensure_attached(&self) -> StoreResult<()> {
        if self.attached {
            Ok(())
        } else {
            Err(StoreError::invalid_argument("datastore handle is closed"))
        }
    }

    fn resolve<T>(&self, offset: Offset) -> *mut T {
        // SAFETY: allocator offsets always lie inside the mapped segment.
        unsafe { self.allocator.base().offset(offset as isize) as *mut T }
    }

    fn offset_of(&self, addr: *const u8) -> StoreResult<Offset> {
        let base = self.allocator.base() as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + self.allocator.current_size() {
            return Err(StoreError::invalid_argument(
                "pointer is not inside the segment",
            ));
        }
        Ok((addr - base) as Offset)
    }

    fn typed_address<T: 'static>(&self, entry: &ObjectEntry) -> StoreResult<*mut T> {
        if entry.type_id != type_name::<T>() {
            return Err(StoreError::invalid_argument(format!(
                "'{}' holds a {} instance, not {}",
                entry.name,
                entry.type_id,
                type_name::<T>()
            )));
        }
        Ok(self.resolve::<T>(entry.offset))
    }
}

fn run_init<T, F>(ptr: *mut T, count: usize, init: &mut F) -> StoreResult<()>
where
    F: FnMut(usize) -> Result<T, StoreError>,
{
    for index in 0..count {
        match init(index) {
            // SAFETY: the slot is inside the allocation sized for `count`
            // elements and not yet initialized.
            Ok(value) => unsafe { ptr.add(index).write(value) },
            Err(e) => {
                // Unwind the constructed prefix in reverse order.
                for built in (0..index).rev() {
                    // SAFETY: slots below `index` were initialized above.
                    unsafe { std::ptr::drop_in_place(ptr.add(built)) };
                }
                return Err(StoreError::ConstructorFailed {
                    index,
                    source: Box::new(e),
                });
            }
        }
    }
    Ok(())
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.close() {
                error!(
                    "failed to close datastore at {}: {}",
                    self.base_path.display(),
                    e
                );
            }
        }
    }
}
