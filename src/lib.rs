#![no_std]

//! A segregated free list memory allocator.
//!
//! The allocator manages a single contiguous heap obtained from a
//! [`PageProvider`] and hands out 16-byte aligned payloads. Free blocks
//! are kept on 14 size-class buckets and placed with a bounded best-fit
//! search; released blocks are coalesced eagerly with their neighbors.

#[cfg(test)]
extern crate std;

mod alignment;
mod blocks;
mod buckets;
mod checker;
mod header;
mod provider;

#[cfg(test)]
mod tests;

use core::cmp;
use core::ptr::null_mut;

use log::debug;

use alignment::{align_up, is_aligned};
use blocks::{Block, FreeBlock, FreeBlockRef, UsedBlock, HEADER_SIZE, MIN_BLOCK_SIZE, WORD_SIZE};
use buckets::FreeListDirectory;
use header::HeaderWord;

pub use checker::HeapStats;
#[cfg(feature = "libc")]
pub use provider::Sbrk;
pub use provider::{BoundedHeap, PageProvider};

/// The alignment of every payload pointer handed out.
pub const BLOCK_ALIGN: usize = header::SIZE_ALIGN;

/// The least amount requested from the page provider when the heap has to
/// grow, so that small allocations don't extend it one block at a time.
pub const CHUNK_SIZE: usize = 4096;

/// A segregated free list allocator over a page provider.
///
/// A freshly constructed allocator has no heap and refuses every request;
/// call [`init`](Allocator::init) to set up the heap region. The allocator
/// itself is single-threaded; the `spin` feature provides a locked wrapper
/// for sharing it.
pub struct Allocator<P> {
    provider: P,
    directory: FreeListDirectory,
    /// Address of the first block header, directly above the prologue.
    /// Zero until `init` has written the sentinels.
    heap_start: usize,
}

impl<P: PageProvider> Allocator<P> {
    /// Creates an allocator that will draw its heap from the given
    /// provider once initialized.
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            directory: FreeListDirectory::new(),
            heap_start: 0,
        }
    }

    /// Checks if the heap was already set up by a call to `init`.
    pub fn was_initialized(&self) -> bool {
        self.heap_start != 0
    }

    /// Sets up the heap: writes the prologue and epilogue sentinels and
    /// seeds the heap with one free block of [`CHUNK_SIZE`] bytes.
    ///
    /// Returns `false` if the provider refuses the initial pages.
    ///
    /// # Safety
    ///
    /// The provider's region must be valid for the lifetime of the
    /// allocator. Panics if the allocator was already initialized.
    pub unsafe fn init(&mut self) -> bool {
        if self.was_initialized() {
            panic!("the heap was already initialized");
        }

        self.directory.clear();
        let base = match self.provider.extend(2 * WORD_SIZE) {
            Some(base) => base.as_ptr() as usize,
            None => return false,
        };
        debug_assert!(is_aligned(base, BLOCK_ALIGN));

        // the prologue terminates backward walks, the epilogue forward
        // walks. The prologue is not a minimum-size block, so the initial
        // epilogue starts with prev_is_min clear.
        *(base as *mut HeaderWord) = HeaderWord::pack(0, true, true, true);
        *((base + WORD_SIZE) as *mut HeaderWord) = HeaderWord::pack(0, true, true, false);
        self.heap_start = base + WORD_SIZE;

        self.extend_heap(CHUNK_SIZE).is_some()
    }

    /// Allocates `size` bytes and returns a 16-byte aligned pointer to
    /// them, or null if `size` is zero or the heap cannot satisfy the
    /// request.
    ///
    /// # Safety
    ///
    /// The allocator must outlive every pointer it hands out.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if !self.was_initialized() || size == 0 {
            return null_mut();
        }

        // round the request plus header up to the block granularity
        let asize = match size.checked_add(HEADER_SIZE + MIN_BLOCK_SIZE - 1) {
            Some(padded) => padded & !(MIN_BLOCK_SIZE - 1),
            None => return null_mut(),
        };
        debug!("allocating {} bytes ({} with block overhead)", size, asize);

        let addr = match self.directory.find_fit(asize) {
            Some(ptr) => ptr.as_ptr() as usize,
            None => match self.extend_heap(cmp::max(asize, CHUNK_SIZE)) {
                Some(addr) => addr,
                None => return null_mut(),
            },
        };

        let block = FreeBlock::from_addr(addr);
        let block_size = block.size();
        self.mark_allocated(block);
        self.sync_next(addr + block_size, true, block_size == MIN_BLOCK_SIZE);
        self.split_block(addr, asize);

        debug_assert!(self.check_heap());
        (addr + HEADER_SIZE) as *mut u8
    }

    /// Releases a pointer previously returned by [`allocate`]. Releasing
    /// null is a no-op.
    ///
    /// [`allocate`]: Allocator::allocate
    ///
    /// # Safety
    ///
    /// The pointer must have come from this allocator and must not have
    /// been released before.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let block = UsedBlock::from_payload(ptr);
        let word = block.header().word();
        debug_assert!(
            word.self_alloc(),
            "released pointer does not belong to an allocated block"
        );
        let addr = block.addr();
        let size = word.size();
        debug!("releasing a {} byte block", size);

        self.mark_free(addr, size, word.prev_alloc(), word.prev_is_min());
        self.sync_next(addr + size, false, size == MIN_BLOCK_SIZE);
        self.coalesce(addr);

        debug_assert!(self.check_heap());
    }

    /// Resizes an allocation, moving it if necessary.
    ///
    /// With a null pointer this is [`allocate`]; with a zero size it is
    /// [`release`] and returns null. On failure the original allocation is
    /// left untouched and null is returned.
    ///
    /// [`allocate`]: Allocator::allocate
    /// [`release`]: Allocator::release
    ///
    /// # Safety
    ///
    /// The pointer must be null or a live allocation of this allocator.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.release(ptr);
            return null_mut();
        }
        if ptr.is_null() {
            return self.allocate(size);
        }

        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        let old_block = UsedBlock::from_payload(ptr);
        let copy_size = cmp::min(size, old_block.payload_size());
        core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_size);
        self.release(ptr);

        new_ptr
    }

    /// Allocates room for `count` elements of `size` bytes each and
    /// zero-fills it. Returns null when the multiplication overflows or
    /// the allocation fails.
    ///
    /// # Safety
    ///
    /// See [`allocate`](Allocator::allocate).
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return null_mut(),
        };

        let ptr = self.allocate(total);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, total);
        }
        ptr
    }

    /// Grows the heap, turning the region past the old epilogue into a
    /// free block and writing a fresh epilogue behind it. The new block is
    /// merged with the old heap tail when that tail is free. Returns the
    /// address of the resulting block.
    unsafe fn extend_heap(&mut self, n: usize) -> Option<usize> {
        let n = align_up(n, MIN_BLOCK_SIZE);
        let base = self.provider.extend(n)?.as_ptr() as usize;
        debug!("extended the heap by {} bytes", n);

        // the old epilogue word becomes the header of the extension block
        let addr = base - WORD_SIZE;
        let old = Block::header_at(addr).word();
        self.mark_free(addr, n, old.prev_alloc(), old.prev_is_min());
        *((addr + n) as *mut HeaderWord) = HeaderWord::pack(0, false, true, n == MIN_BLOCK_SIZE);

        Some(self.coalesce(addr))
    }

    /// free→alloc: pulls the block from its bucket and flips its state
    /// bit. Allocated blocks carry no footer.
    unsafe fn mark_allocated(&mut self, block: FreeBlockRef) {
        let addr = block.addr();
        self.directory.remove(block);
        Block::header_at(addr).word_mut().set_self_alloc(true);
    }

    /// alloc→free: writes the header (and the mirroring footer, unless the
    /// block has minimum size) and shelves the block in its bucket.
    unsafe fn mark_free(&mut self, addr: usize, size: usize, prev_alloc: bool, prev_is_min: bool) {
        let word = HeaderWord::pack(size, prev_alloc, false, prev_is_min);
        *(addr as *mut HeaderWord) = word;
        let block = FreeBlock::from_addr(addr);
        if !block.is_min() {
            *block.footer() = word;
        }
        self.directory.insert(block);
    }

    /// Rewrites a successor's view of the state of the block below it,
    /// mirroring the change into the successor's footer when it has one.
    /// The successor may be the epilogue.
    unsafe fn sync_next(&mut self, next_addr: usize, prev_alloc: bool, prev_is_min: bool) {
        let header = Block::header_at(next_addr).word_mut();
        header.set_prev_alloc(prev_alloc);
        header.set_prev_is_min(prev_is_min);

        let word = *header;
        if !word.self_alloc() && word.size() > MIN_BLOCK_SIZE {
            *FreeBlock::from_addr(next_addr).footer() = word;
        }
    }

    /// Carves the tail off a freshly allocated block when the leftover is
    /// big enough to stand on its own.
    unsafe fn split_block(&mut self, addr: usize, asize: usize) {
        let header = Block::header_at(addr).word_mut();
        let total = header.size();
        if total - asize < MIN_BLOCK_SIZE {
            return;
        }

        header.set_size(asize);
        let tail_addr = addr + asize;
        let tail_size = total - asize;
        self.mark_free(tail_addr, tail_size, true, asize == MIN_BLOCK_SIZE);
        self.sync_next(tail_addr + tail_size, false, tail_size == MIN_BLOCK_SIZE);
    }

    /// Merges a just-freed block with whichever of its neighbors are free.
    /// Returns the address of the resulting block.
    unsafe fn coalesce(&mut self, addr: usize) -> usize {
        let word = Block::header_at(addr).word();
        let size = word.size();
        let next_addr = addr + size;
        let next_word = Block::header_at(next_addr).word();
        let next_free = !next_word.self_alloc();

        if !word.prev_alloc() {
            let prev_addr = Block::header_at(addr).prev_addr();
            let prev_word = Block::header_at(prev_addr).word();

            self.directory.remove(FreeBlock::from_addr(addr));
            self.directory.remove(FreeBlock::from_addr(prev_addr));
            let mut merged = prev_word.size() + size;
            if next_free {
                self.directory.remove(FreeBlock::from_addr(next_addr));
                merged += next_word.size();
            }
            self.mark_free(
                prev_addr,
                merged,
                prev_word.prev_alloc(),
                prev_word.prev_is_min(),
            );
            self.sync_next(prev_addr + merged, false, merged == MIN_BLOCK_SIZE);
            prev_addr
        } else if next_free {
            let merged = size + next_word.size();
            self.directory.remove(FreeBlock::from_addr(addr));
            self.directory.remove(FreeBlock::from_addr(next_addr));
            self.mark_free(addr, merged, word.prev_alloc(), word.prev_is_min());
            self.sync_next(addr + merged, false, merged == MIN_BLOCK_SIZE);
            addr
        } else {
            addr
        }
    }
}

unsafe impl<P: Send> Send for Allocator<P> {}

/// A spin locked allocator that can be used as the global allocator.
#[cfg(feature = "spin")]
pub struct SpinLockedAllocator<P>(spin::Mutex<Allocator<P>>);

#[cfg(feature = "spin")]
impl<P: PageProvider> SpinLockedAllocator<P> {
    /// Creates a locked allocator over the given provider. The heap is not
    /// set up until [`init`](SpinLockedAllocator::init) is called.
    pub const fn new(provider: P) -> Self {
        Self(spin::Mutex::new(Allocator::new(provider)))
    }

    /// Sets up the heap.
    ///
    /// # Safety
    ///
    /// See [`Allocator::init`].
    pub unsafe fn init(&self) -> bool {
        self.0.lock().init()
    }
}

#[cfg(feature = "spin")]
unsafe impl<P: PageProvider + Send> core::alloc::GlobalAlloc for SpinLockedAllocator<P> {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return null_mut();
        }
        self.0.lock().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        self.0.lock().release(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return null_mut();
        }
        self.0.lock().zero_allocate(layout.size(), 1)
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: core::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return null_mut();
        }
        self.0.lock().reallocate(ptr, new_size)
    }
}
