use super::*;

use crate::blocks::{Block, BlockRef, HEADER_SIZE, MIN_BLOCK_SIZE, UsedBlock};

#[test]
fn init_fails_without_capacity() {
    let mut allocator =
        Allocator::new(unsafe { BoundedHeap::new(BLOCK_ALIGN as *mut u8, 0) });
    assert!(!unsafe { allocator.init() });
    assert!(!allocator.was_initialized());
}

#[test]
fn allocate_before_init_returns_null() {
    let mut allocator =
        Allocator::new(unsafe { BoundedHeap::new(BLOCK_ALIGN as *mut u8, 0) });
    let allocated = unsafe { allocator.allocate(1) };
    assert!(allocated.is_null());
}

#[test]
fn allocate_zero_returns_null() {
    let mut guard = HeapGuard::init(SEED_HEAP);
    let allocated = unsafe { guard.allocator.allocate(0) };
    assert!(allocated.is_null());
    assert_single_free_block(&guard.allocator, CHUNK_SIZE);
}

#[test]
fn payloads_are_16_byte_aligned() {
    let mut guard = HeapGuard::init(SEED_HEAP);
    for size in [1, 7, 8, 24, 100, 1000] {
        let allocated = unsafe { guard.allocator.allocate(size) };
        assert!(!allocated.is_null());
        assert_eq!(allocated as usize % BLOCK_ALIGN, 0);
    }
    assert!(guard.allocator.check_heap());
}

#[test]
fn min_blocks_are_adjacent_and_marked() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    let p1 = unsafe { guard.allocator.allocate(1) };
    let p2 = unsafe { guard.allocator.allocate(1) };
    assert!(!p1.is_null() && !p2.is_null());
    assert_ne!(p1, p2);

    let b1 = unsafe { UsedBlock::from_payload(p1) };
    let b2 = unsafe { UsedBlock::from_payload(p2) };
    assert_eq!(b1.size(), MIN_BLOCK_SIZE);
    assert_eq!(b2.size(), MIN_BLOCK_SIZE);
    assert_eq!(b2.addr(), b1.addr() + MIN_BLOCK_SIZE);

    // the successor of a minimum-size block knows about it
    assert!(b2.header().prev_is_min());
    assert!(b2.header().prev_alloc());
    assert!(guard.allocator.check_heap());
}

#[test]
fn allocate_splits_the_seed_block() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    let allocated = unsafe { guard.allocator.allocate(100) };
    assert!(!allocated.is_null());

    let block = unsafe { UsedBlock::from_payload(allocated) };
    assert_eq!(block.size(), 112);
    assert_eq!(block.payload_size(), 112 - HEADER_SIZE);

    // the carved tail is a free block right behind the allocation
    match unsafe { Block::from_addr(block.addr() + block.size()) } {
        BlockRef::Free(tail) => {
            assert_eq!(tail.size(), CHUNK_SIZE - 112);
            assert!(tail.header().prev_alloc());
        }
        BlockRef::Used(_) => panic!("the carved tail is marked as used"),
    }
    assert_single_free_block(&guard.allocator, CHUNK_SIZE - 112);
}

#[test]
fn allocate_perfect_fit_consumes_the_block() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    let allocated = unsafe { guard.allocator.allocate(CHUNK_SIZE - HEADER_SIZE) };
    assert!(!allocated.is_null());

    let block = unsafe { UsedBlock::from_payload(allocated) };
    assert_eq!(block.size(), CHUNK_SIZE);

    assert!(guard.allocator.check_heap());
    assert_eq!(guard.allocator.stats().free_blocks, 0);
}

#[test]
fn allocate_reuses_a_released_block() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    let a = unsafe { guard.allocator.allocate(24) };
    // keep the free tail from swallowing `a` when it is released
    let _separator = unsafe { guard.allocator.allocate(24) };
    unsafe { guard.allocator.release(a) };

    let again = unsafe { guard.allocator.allocate(24) };
    assert_eq!(again, a);
    assert!(guard.allocator.check_heap());
}

#[test]
fn placement_prefers_near_exact_fit() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    let small = unsafe { guard.allocator.allocate(72) }; // an 80 byte block
    let _g1 = unsafe { guard.allocator.allocate(8) };
    let large = unsafe { guard.allocator.allocate(120) }; // a 128 byte block
    let _g2 = unsafe { guard.allocator.allocate(8) };

    // both land in the same bucket, the 128 byte block in front
    unsafe { guard.allocator.release(small) };
    unsafe { guard.allocator.release(large) };

    // the scan must pass over the larger head and take the exact fit
    let again = unsafe { guard.allocator.allocate(72) };
    assert_eq!(again, small);
    assert!(guard.allocator.check_heap());
}

#[test]
fn exhaustion_returns_null_and_keeps_the_heap_valid() {
    let mut guard = HeapGuard::init(SEED_HEAP);

    // needs a block of CHUNK_SIZE + 16 and the provider has nothing left
    let allocated = unsafe { guard.allocator.allocate(CHUNK_SIZE) };
    assert!(allocated.is_null());

    assert_single_free_block(&guard.allocator, CHUNK_SIZE);
}

#[test]
fn extension_merges_with_the_free_tail() {
    let mut guard = HeapGuard::init(SEED_HEAP + 5008);

    // too big for the seed block, so the heap grows by exactly the
    // rounded request and the extension coalesces with the seed block
    let allocated = unsafe { guard.allocator.allocate(5000) };
    assert!(!allocated.is_null());

    let block = unsafe { UsedBlock::from_payload(allocated) };
    assert_eq!(block.size(), 5008);
    assert_single_free_block(&guard.allocator, CHUNK_SIZE);
}
