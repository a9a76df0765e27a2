/*!
 * Aligned Allocation Tests
 */

use heapstore::{StoreError, StoreManager, CHUNK_SIZE};

const MIB: usize = 1024 * 1024;

#[test]
fn test_alignment_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 64 * MIB).unwrap();

    for align in [1usize, 2, 8, 64, 256, 4096, 65536, CHUNK_SIZE] {
        for size in [1usize, 24, 1000, 100_000, 3 * MIB] {
            let p = mgr.allocate_aligned(size, align).unwrap();
            assert_eq!(
                p as usize % align,
                0,
                "allocate_aligned({}, {}) returned a misaligned address",
                size,
                align
            );
            mgr.deallocate(p).unwrap();
        }
    }
    assert!(mgr.all_memory_deallocated());
    mgr.close().unwrap();
}

#[test]
fn test_unsupported_alignment_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 8 * MIB).unwrap();

    // Not a power of two.
    assert!(matches!(
        mgr.allocate_aligned(64, 48),
        Err(StoreError::InvalidArgument(_))
    ));
    // Larger than a chunk.
    assert!(matches!(
        mgr.allocate_aligned(64, 2 * CHUNK_SIZE),
        Err(StoreError::InvalidArgument(_))
    ));
    mgr.close().unwrap();
}

#[test]
fn test_aligned_small_request_picks_multiple_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::create_with_capacity(dir.path(), 16 * MIB).unwrap();

    // Several in a row all stay aligned (slot size must be a multiple of
    // the alignment, not just the first slot).
    let mut ptrs = Vec::new();
    for _ in 0..32 {
        let p = mgr.allocate_aligned(17, 16).unwrap();
        assert_eq!(p as usize % 16, 0);
        ptrs.push(p);
    }
    for p in ptrs {
        mgr.deallocate(p).unwrap();
    }
    mgr.close().unwrap();
}
