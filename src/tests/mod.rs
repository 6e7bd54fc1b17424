mod alloc_tests;

use core::alloc::Layout;

use crate::blocks::WORD_SIZE;
use crate::provider::BoundedHeap;
use crate::{Allocator, BLOCK_ALIGN, CHUNK_SIZE};

/// Provider capacity that seeds the heap with exactly one free block of
/// `CHUNK_SIZE` bytes and leaves no room to grow any further.
const SEED_HEAP: usize = 2 * WORD_SIZE + CHUNK_SIZE;

/// Backs an allocator with a region obtained from the system allocator
/// and returns the region when dropped.
struct HeapGuard {
    addr: usize,
    layout: Layout,
    allocator: Allocator<BoundedHeap>,
}

impl HeapGuard {
    /// Sets up an allocator over a fresh region of `capacity` bytes.
    fn init(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, BLOCK_ALIGN).unwrap();
        let addr = unsafe { std::alloc::alloc(layout) } as usize;
        assert!(addr != 0, "failed to back the test heap");

        let mut allocator =
            Allocator::new(unsafe { BoundedHeap::new(addr as *mut u8, capacity) });
        assert!(unsafe { allocator.init() });

        Self {
            addr,
            layout,
            allocator,
        }
    }
}

impl Drop for HeapGuard {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.addr as *mut u8, self.layout) }
    }
}

/// Asserts that every invariant holds and that the heap contains exactly
/// one free block of the given size.
fn assert_single_free_block(allocator: &Allocator<BoundedHeap>, size: usize) {
    assert!(allocator.check_heap());
    let stats = allocator.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, size);
}
