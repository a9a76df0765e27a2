/*!
 * Snapshot / Copy / Remove Tests
 */

use heapstore::{StoreError, StoreManager};
use pretty_assertions::assert_eq;

const MIB: usize = 1024 * 1024;

#[test]
fn test_snapshot_survives_source_removal() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let snap = root.path().join("snap");

    let mut mgr = StoreManager::create_with_capacity(&src, 32 * MIB).unwrap();
    for i in 0..10u64 {
        mgr.construct::<u64, _>(&format!("entry-{}", i), 1, move |_| Ok(i))
            .unwrap();
    }
    let src_uuid = mgr.uuid().to_string();
    mgr.snapshot(&snap, true, 0).unwrap();
    mgr.close().unwrap();

    // The snapshot is a store of its own, with its own identity.
    let snap_uuid = StoreManager::get_uuid(&snap).unwrap();
    assert_ne!(snap_uuid, src_uuid);
    assert!(StoreManager::consistent(&snap));

    StoreManager::remove(&src).unwrap();
    assert!(!StoreManager::consistent(&src));

    let mut mgr = StoreManager::open(&snap).unwrap();
    for i in 0..10u64 {
        let (p, _) = mgr.find::<u64>(&format!("entry-{}", i)).unwrap();
        assert_eq!(unsafe { *p }, i);
    }
    mgr.close().unwrap();
}

#[test]
fn test_snapshot_is_independent_of_later_mutation() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let snap = root.path().join("snap");

    let mut mgr = StoreManager::create_with_capacity(&src, 32 * MIB).unwrap();
    let p = mgr.construct::<u64, _>("cell", 1, |_| Ok(1)).unwrap();
    mgr.snapshot(&snap, true, 0).unwrap();

    // Mutate the source after the snapshot.
    unsafe { p.write(999) };
    mgr.construct::<u64, _>("later", 1, |_| Ok(2)).unwrap();
    mgr.close().unwrap();

    let mut mgr = StoreManager::open_read_only(&snap).unwrap();
    let (cell, _) = mgr.find::<u64>("cell").unwrap();
    assert_eq!(unsafe { *cell }, 1);
    assert!(mgr.find::<u64>("later").is_none());
    mgr.close().unwrap();
}

#[test]
fn test_snapshot_async_matches_sync() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let snap = root.path().join("snap");

    let mut mgr = StoreManager::create_with_capacity(&src, 16 * MIB).unwrap();
    mgr.construct::<u64, _>("x", 1, |_| Ok(5)).unwrap();
    let op = mgr.snapshot_async(&snap, true, 2).unwrap();
    op.wait().unwrap();
    mgr.close().unwrap();

    let mut mgr = StoreManager::open_read_only(&snap).unwrap();
    let (x, _) = mgr.find::<u64>("x").unwrap();
    assert_eq!(unsafe { *x }, 5);
    mgr.close().unwrap();
}

#[test]
fn test_copy_preserves_uuid() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let dst = root.path().join("dst");

    let mut mgr = StoreManager::create_with_capacity(&src, 16 * MIB).unwrap();
    mgr.construct::<u64, _>("x", 1, |_| Ok(3)).unwrap();
    mgr.close().unwrap();

    StoreManager::copy(&src, &dst, true, 0).unwrap();
    assert_eq!(
        StoreManager::get_uuid(&dst).unwrap(),
        StoreManager::get_uuid(&src).unwrap()
    );

    let mut mgr = StoreManager::open(&dst).unwrap();
    let (x, _) = mgr.find::<u64>("x").unwrap();
    assert_eq!(unsafe { *x }, 3);
    mgr.close().unwrap();
}

#[test]
fn test_copy_refuses_inconsistent_source() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let dst = root.path().join("dst");

    let mgr = StoreManager::create_with_capacity(&src, 8 * MIB).unwrap();
    // Source is open (marker absent): copying would capture a torn state.
    assert!(matches!(
        StoreManager::copy(&src, &dst, true, 0),
        Err(StoreError::Inconsistent { .. })
    ));
    drop(mgr);
}

#[test]
fn test_copy_async() {
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let dst = root.path().join("dst");

    let mut mgr = StoreManager::create_with_capacity(&src, 16 * MIB).unwrap();
    mgr.construct::<u32, _>("n", 16, |i| Ok(i as u32)).unwrap();
    mgr.close().unwrap();

    StoreManager::copy_async(&src, &dst, false, 4).wait().unwrap();
    let mut mgr = StoreManager::open_read_only(&dst).unwrap();
    let (n, count) = mgr.find::<u32>("n").unwrap();
    assert_eq!(count, 16);
    assert_eq!(unsafe { *n.add(15) }, 15);
    mgr.close().unwrap();
}

#[test]
fn test_remove_async() {
    let root = tempfile::tempdir().unwrap();
    let base = root.path().join("store");

    let mut mgr = StoreManager::create_with_capacity(&base, 8 * MIB).unwrap();
    mgr.close().unwrap();
    assert!(StoreManager::consistent(&base));

    StoreManager::remove_async(&base).wait().unwrap();
    assert!(!StoreManager::consistent(&base));
    assert!(!base.join("datastore").exists());
}
