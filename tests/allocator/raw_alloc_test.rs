/*!
 * Raw Allocation Tests
 * allocate/deallocate through the manager, capacity limits, reuse
 */

use heapstore::{StoreError, StoreManager, CHUNK_SIZE};
use pretty_assertions::assert_eq;

const MIB: usize = 1024 * 1024;

#[test]
fn test_allocate_deallocate_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 64 * MIB).unwrap();

    let p = mgr.allocate(64).unwrap();
    assert!(!p.is_null());
    unsafe { p.write_bytes(0xAB, 64) };
    mgr.deallocate(p).unwrap();
    assert!(mgr.all_memory_deallocated());

    mgr.close().unwrap();
}

#[test]
fn test_allocations_do_not_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 256 * MIB).unwrap();

    let sizes = [
        1usize, 8, 24, 100, 512, 4096, 70_000, 300_000, 600_000, 3 * MIB,
    ];
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (i, &size) in sizes.iter().cycle().take(50).enumerate() {
        let p = mgr.allocate(size).unwrap() as usize;
        // Touch both ends to prove the range is really mapped.
        unsafe {
            (p as *mut u8).write(i as u8);
            ((p + size - 1) as *mut u8).write(i as u8);
        }
        spans.push((p, size));
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "allocations overlap: {:?}",
            pair
        );
    }

    for &(addr, _) in &spans {
        mgr.deallocate(addr as *mut u8).unwrap();
    }
    assert!(mgr.all_memory_deallocated());
    mgr.close().unwrap();
}

#[test]
fn test_capacity_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 8 * MIB).unwrap();
    assert_eq!(StoreManager::chunk_size(), 2 * MIB);

    // Two 3 MiB requests take two chunks each: the whole 8 MiB reservation.
    let first = mgr.allocate(3 * MIB).unwrap();
    let second = mgr.allocate(3 * MIB).unwrap();
    assert!(!first.is_null() && !second.is_null());

    // Even one more byte needs a fresh chunk, which cannot be mapped.
    match mgr.allocate(1) {
        Err(StoreError::OutOfMemory { .. }) => {}
        other => panic!("expected OutOfMemory, got {:?}", other.map(|_| ())),
    }

    mgr.deallocate(first).unwrap();
    assert!(mgr.allocate(1).is_ok());
    mgr.close().unwrap();
}

#[test]
fn test_slab_slot_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let a = mgr.allocate(64).unwrap();
    let b = mgr.allocate(64).unwrap();
    assert_ne!(a, b);
    mgr.deallocate(a).unwrap();

    // The freed slot is the most attractive one in its slab again.
    let c = mgr.allocate(64).unwrap();
    assert_eq!(a, c);
    mgr.close().unwrap();
}

#[test]
fn test_deallocate_rejects_bad_pointers() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    // Foreign pointer.
    let mut local = 0u8;
    assert!(matches!(
        mgr.deallocate(&mut local as *mut u8),
        Err(StoreError::InvalidArgument(_))
    ));

    // Interior pointer of a multi-chunk run.
    let big = mgr.allocate(3 * MIB).unwrap();
    let interior = unsafe { big.add(CHUNK_SIZE) };
    assert!(matches!(
        mgr.deallocate(interior),
        Err(StoreError::InvalidArgument(_))
    ));

    // Double free of a slab slot.
    let small = mgr.allocate(128).unwrap();
    mgr.deallocate(small).unwrap();
    assert!(matches!(
        mgr.deallocate(small),
        Err(StoreError::InvalidArgument(_))
    ));

    mgr.close().unwrap();
}

#[test]
fn test_zero_byte_allocation_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 8 * MIB).unwrap();
    assert!(matches!(
        mgr.allocate(0),
        Err(StoreError::InvalidArgument(_))
    ));
    mgr.close().unwrap();
}

#[test]
fn test_stats_track_usage() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    let before = mgr.stats();
    assert_eq!(before.used_bytes, 0);

    let p = mgr.allocate(100).unwrap();
    let during = mgr.stats();
    // 100 bytes round up to the 128-byte class.
    assert_eq!(during.used_bytes, 128);
    assert!(during.segment_size >= CHUNK_SIZE);

    mgr.deallocate(p).unwrap();
    assert_eq!(mgr.stats().used_bytes, 0);
    mgr.close().unwrap();
}
