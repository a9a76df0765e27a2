/*!
 * Construction Protocol Tests
 * Named/unique/anonymous construct, find-or-construct, rollback, destroy
 */

use heapstore::{StoreError, StoreManager};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

const MIB: usize = 1024 * 1024;

#[test]
fn test_name_collision() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let first = mgr.construct::<u64, _>("k", 1, |_| Ok(1)).unwrap();
    assert!(matches!(
        mgr.construct::<u64, _>("k", 2, |_| Ok(2)),
        Err(StoreError::NameInUse(_))
    ));

    // The found entry wins: same address, original value, init not run.
    let again = mgr.find_or_construct::<u64, _>("k", 9, |_| Ok(9)).unwrap();
    assert_eq!(first, again);
    assert_eq!(unsafe { *again }, 1);
    let (_, count) = mgr.find::<u64>("k").unwrap();
    assert_eq!(count, 1);

    mgr.close().unwrap();
}

#[test]
fn test_find_respects_type_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    mgr.construct::<u64, _>("x", 1, |_| Ok(5)).unwrap();
    assert!(mgr.find::<u64>("x").is_some());
    assert!(mgr.find::<u32>("x").is_none());
    assert!(matches!(
        mgr.destroy::<u32>("x"),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(mgr.destroy::<u64>("x").unwrap());

    mgr.close().unwrap();
}

#[test]
fn test_failed_init_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let result = mgr.construct::<u64, _>("partial", 10, |i| {
        if i < 3 {
            Ok(i as u64)
        } else {
            Err(StoreError::invalid_argument("element 3 refuses"))
        }
    });
    match result {
        Err(StoreError::ConstructorFailed { index, .. }) => assert_eq!(index, 3),
        other => panic!("expected ConstructorFailed, got {:?}", other.map(|_| ())),
    }

    // The name is free again and no memory is held.
    assert!(mgr.find::<u64>("partial").is_none());
    assert!(mgr.all_memory_deallocated());
    assert!(mgr.construct::<u64, _>("partial", 1, |_| Ok(0)).is_ok());

    mgr.close().unwrap();
}

static LIVE_TRACKED: AtomicUsize = AtomicUsize::new(0);

struct Tracked(u32);

impl Tracked {
    fn new(v: u32) -> Self {
        LIVE_TRACKED.fetch_add(1, Ordering::SeqCst);
        Tracked(v)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        LIVE_TRACKED.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
#[serial]
fn test_destroy_runs_destructors() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    mgr.construct::<Tracked, _>("tracked", 5, |i| Ok(Tracked::new(i as u32)))
        .unwrap();
    assert_eq!(LIVE_TRACKED.load(Ordering::SeqCst), 5);

    assert!(mgr.destroy::<Tracked>("tracked").unwrap());
    assert_eq!(LIVE_TRACKED.load(Ordering::SeqCst), 0);
    assert!(mgr.all_memory_deallocated());

    // Destroying an absent name reports false, not an error.
    assert!(!mgr.destroy::<Tracked>("tracked").unwrap());

    mgr.close().unwrap();
}

#[test]
#[serial]
fn test_failed_init_drops_prefix_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let result = mgr.construct::<Tracked, _>("doomed", 8, |i| {
        if i < 4 {
            Ok(Tracked::new(i as u32))
        } else {
            Err(StoreError::invalid_argument("no more"))
        }
    });
    assert!(result.is_err());
    // All four constructed elements were dropped during rollback.
    assert_eq!(LIVE_TRACKED.load(Ordering::SeqCst), 0);

    mgr.close().unwrap();
}

#[test]
fn test_unique_instances() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let p = mgr.construct_unique::<u64, _>(4, |i| Ok(i as u64)).unwrap();
    assert!(matches!(
        mgr.construct_unique::<u64, _>(4, |i| Ok(i as u64)),
        Err(StoreError::NameInUse(_))
    ));
    let (found, count) = mgr.find_unique::<u64>().unwrap();
    assert_eq!(found, p);
    assert_eq!(count, 4);

    // A different element type is a different singleton.
    assert!(mgr.find_unique::<u32>().is_none());
    let q = mgr
        .find_or_construct_unique::<u32, _>(1, |_| Ok(77))
        .unwrap();
    assert_eq!(unsafe { *q }, 77);

    assert!(mgr.destroy_unique::<u64>().unwrap());
    assert!(mgr.find_unique::<u64>().is_none());

    mgr.close().unwrap();
}

#[test]
fn test_anonymous_instances() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let p = mgr
        .construct_anonymous::<u64, _>(3, |i| Ok(100 + i as u64))
        .unwrap();
    assert_eq!(unsafe { *p.add(2) }, 102);
    assert_eq!(mgr.anonymous_entries().len(), 1);

    assert!(mgr.destroy_ptr::<u64>(p).unwrap());
    assert!(mgr.anonymous_entries().is_empty());
    assert!(mgr.all_memory_deallocated());

    mgr.close().unwrap();
}

#[test]
fn test_destroy_ptr_rejects_interior_pointer() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let p = mgr
        .construct::<u64, _>("array", 8, |i| Ok(i as u64))
        .unwrap();
    assert!(matches!(
        mgr.destroy_ptr::<u64>(unsafe { p.add(1) }),
        Err(StoreError::InvalidArgument(_))
    ));
    // The object is untouched.
    assert!(mgr.find::<u64>("array").is_some());

    mgr.close().unwrap();
}

#[test]
fn test_destroy_ptr_on_named_instance() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let p = mgr.construct::<u64, _>("byptr", 2, |_| Ok(0)).unwrap();
    assert!(mgr.destroy_ptr::<u64>(p).unwrap());
    assert!(mgr.find::<u64>("byptr").is_none());
    assert!(mgr.all_memory_deallocated());

    mgr.close().unwrap();
}

#[test]
fn test_zero_count_construction_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 8 * MIB).unwrap();
    assert!(matches!(
        mgr.construct::<u64, _>("none", 0, |_| Ok(0)),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        mgr.construct::<u64, _>("", 1, |_| Ok(0)),
        Err(StoreError::InvalidArgument(_))
    ));
    mgr.close().unwrap();
}

#[test]
fn test_constructed_data_round_trips_through_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let mut mgr = StoreManager::create_with_capacity(dir.path(), 32 * MIB).unwrap();
    for i in 0..10u64 {
        mgr.construct::<u64, _>(&format!("obj-{}", i), 4, move |j| Ok(i * 100 + j as u64))
            .unwrap();
    }
    mgr.construct_unique::<u32, _>(1, |_| Ok(31337)).unwrap();
    mgr.close().unwrap();

    let mut mgr = StoreManager::open(dir.path()).unwrap();
    for i in 0..10u64 {
        let (p, count) = mgr.find::<u64>(&format!("obj-{}", i)).unwrap();
        assert_eq!(count, 4);
        for j in 0..4 {
            assert_eq!(unsafe { *p.add(j) }, i * 100 + j as u64);
        }
    }
    let (q, _) = mgr.find_unique::<u32>().unwrap();
    assert_eq!(unsafe { *q }, 31337);

    // Destroy everything; the heap ends up empty.
    for i in 0..10 {
        assert!(mgr.destroy::<u64>(&format!("obj-{}", i)).unwrap());
    }
    assert!(mgr.destroy_unique::<u32>().unwrap());
    assert!(mgr.all_memory_deallocated());
    mgr.close().unwrap();
}
