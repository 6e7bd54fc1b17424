use core::ptr::NonNull;

use crate::blocks::{FreeBlock, FreeBlockPtr, FreeBlockRef, MIN_BLOCK_SIZE};

/// Number of segregated buckets.
pub const BUCKET_COUNT: usize = 14;

/// The bucket reserved for minimum-size blocks. It is singly linked; a
/// chain terminates in a block whose `next` points to itself.
pub const MIN_BUCKET: usize = 0;

/// How many blocks of a bucket the placement scan examines before it
/// settles for the best candidate seen so far.
pub const SEARCH_LIMIT: usize = 16;

/// A candidate whose leftover would be at most this much is taken
/// immediately instead of finishing the scan.
pub const NEAR_FIT_SLACK: usize = MIN_BLOCK_SIZE;

/// Upper size bound of each bucket. Bucket `i` holds free blocks with
/// `BUCKET_UPPER_BOUNDS[i - 1] < size <= BUCKET_UPPER_BOUNDS[i]`.
pub(crate) const BUCKET_UPPER_BOUNDS: [usize; BUCKET_COUNT] = [
    16,
    32,
    48,
    64,
    128,
    256,
    512,
    1024,
    2048,
    4096,
    8192,
    16384,
    32768,
    usize::MAX,
];

/// The segregated free list directory.
///
/// Bucket 0 holds minimum-size blocks on a singly linked chain; they have
/// no room for a back link. Every other bucket is a circular doubly
/// linked list whose head is the most recently inserted block and whose
/// `head.prev` is the tail.
pub struct FreeListDirectory {
    heads: [Option<FreeBlockPtr>; BUCKET_COUNT],
}

impl FreeListDirectory {
    /// Creates a directory with every bucket empty.
    pub const fn new() -> Self {
        Self {
            heads: [None; BUCKET_COUNT],
        }
    }

    /// Empties every bucket.
    pub fn clear(&mut self) {
        self.heads = [None; BUCKET_COUNT];
    }

    /// The bucket a free block of the given size belongs to: the first
    /// whose upper bound is not below the size.
    pub fn bucket_index(size: usize) -> usize {
        let mut i = 0;
        while size > BUCKET_UPPER_BOUNDS[i] {
            i += 1;
        }
        i
    }

    pub(crate) fn head(&self, index: usize) -> Option<FreeBlockPtr> {
        self.heads[index]
    }

    /// Inserts a free block at the head of its bucket.
    ///
    /// # Safety
    ///
    /// The block's header must already describe it as free with its final
    /// size, and it must not currently be on any bucket.
    pub unsafe fn insert(&mut self, block: FreeBlockRef) {
        let index = Self::bucket_index(block.size());
        if index == MIN_BUCKET {
            self.insert_min(block);
        } else {
            self.insert_ring(index, block);
        }
    }

    /// Removes a free block from its bucket.
    ///
    /// # Safety
    ///
    /// The block must be on the bucket matching its current size.
    pub unsafe fn remove(&mut self, block: &mut FreeBlock) {
        let index = Self::bucket_index(block.size());
        if index == MIN_BUCKET {
            self.remove_min(block);
        } else {
            self.remove_ring(index, block);
        }
    }

    /// Searches the buckets that can hold `asize` for a free block of at
    /// least that size.
    ///
    /// Each bucket gets a bounded best-fit scan: up to [`SEARCH_LIMIT`]
    /// blocks are examined, a candidate within [`NEAR_FIT_SLACK`] of the
    /// request is taken on the spot, and otherwise the scan keeps the
    /// candidate with the least leftover. Buckets are visited in
    /// increasing size order until one yields a candidate.
    pub unsafe fn find_fit(&self, asize: usize) -> Option<FreeBlockPtr> {
        for index in Self::bucket_index(asize)..BUCKET_COUNT {
            let found = if index == MIN_BUCKET {
                // every block here is minimum-size, an exact fit
                debug_assert!(asize == MIN_BLOCK_SIZE);
                self.heads[MIN_BUCKET]
            } else {
                self.scan_ring(index, asize)
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    unsafe fn insert_min(&mut self, block: FreeBlockRef) {
        let ptr = NonNull::from(&mut *block);
        match self.heads[MIN_BUCKET] {
            // a self loop terminates the chain
            None => block.set_next(ptr),
            Some(head) => block.set_next(head),
        }
        self.heads[MIN_BUCKET] = Some(ptr);
    }

    unsafe fn insert_ring(&mut self, index: usize, block: FreeBlockRef) {
        let ptr = NonNull::from(&mut *block);
        match self.heads[index] {
            None => {
                block.set_next(ptr);
                block.set_prev(ptr);
            }
            Some(head_ptr) => {
                let tail_ptr = (*head_ptr.as_ptr()).prev();
                block.set_prev(tail_ptr);
                block.set_next(head_ptr);
                (*tail_ptr.as_ptr()).set_next(ptr);
                (*head_ptr.as_ptr()).set_prev(ptr);
            }
        }
        self.heads[index] = Some(ptr);
    }

    unsafe fn remove_min(&mut self, block: &mut FreeBlock) {
        let ptr = NonNull::from(&mut *block);
        let head = match self.heads[MIN_BUCKET] {
            Some(head) => head,
            None => return,
        };

        if head == ptr {
            self.heads[MIN_BUCKET] = if block.next() == ptr {
                None
            } else {
                Some(block.next())
            };
            return;
        }

        let mut cur = head;
        loop {
            let cur_ref = &mut *cur.as_ptr();
            if cur_ref.next() == ptr {
                // removing the self-looped tail makes the predecessor the
                // new tail
                let next = if block.next() == ptr { cur } else { block.next() };
                cur_ref.set_next(next);
                return;
            }
            if cur_ref.next() == cur {
                return;
            }
            cur = cur_ref.next();
        }
    }

    unsafe fn remove_ring(&mut self, index: usize, block: &mut FreeBlock) {
        let ptr = NonNull::from(&mut *block);
        if block.next() == ptr {
            // the only element of the ring
            debug_assert!(self.heads[index] == Some(ptr));
            self.heads[index] = None;
            return;
        }

        let next = block.next();
        let prev = block.prev();
        (*prev.as_ptr()).set_next(next);
        (*next.as_ptr()).set_prev(prev);
        if self.heads[index] == Some(ptr) {
            self.heads[index] = Some(next);
        }
    }

    unsafe fn scan_ring(&self, index: usize, asize: usize) -> Option<FreeBlockPtr> {
        let head = self.heads[index]?;
        let mut best: Option<FreeBlockPtr> = None;
        let mut best_slack = usize::MAX;

        let mut cur = head;
        for _ in 0..SEARCH_LIMIT {
            let block = &*cur.as_ptr();
            let size = block.size();
            if size >= asize {
                let slack = size - asize;
                if slack <= NEAR_FIT_SLACK {
                    return Some(cur);
                }
                if slack < best_slack {
                    best_slack = slack;
                    best = Some(cur);
                }
            }
            cur = block.next();
            if cur == head {
                break;
            }
        }
        best
    }
}
