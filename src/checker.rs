use log::debug;

use crate::blocks::{Block, HEADER_SIZE, MIN_BLOCK_SIZE, WORD_SIZE};
use crate::buckets::{BUCKET_COUNT, BUCKET_UPPER_BOUNDS, MIN_BUCKET};
use crate::header::HeaderWord;
use crate::provider::PageProvider;
use crate::{Allocator, BLOCK_ALIGN};

/// A point-in-time summary of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of free blocks on the implicit list.
    pub free_blocks: usize,
    /// Bytes held by free blocks, headers included.
    pub free_bytes: usize,
    /// Total bytes of the heap region, sentinels included.
    pub heap_bytes: usize,
}

impl<P: PageProvider> Allocator<P> {
    /// Walks the implicit list and reports how much of the heap is free.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            free_blocks: 0,
            free_bytes: 0,
            heap_bytes: 0,
        };
        if !self.was_initialized() {
            return stats;
        }

        stats.heap_bytes = self.provider.high() + 1 - self.provider.low();
        let mut addr = self.heap_start;
        loop {
            let word = unsafe { Block::header_at(addr) }.word();
            let size = word.size();
            if size == 0 {
                break;
            }
            if !word.self_alloc() {
                stats.free_blocks += 1;
                stats.free_bytes += size;
            }
            addr += size;
        }
        stats
    }

    /// Validates every structural invariant of the heap: the sentinel
    /// encodings, block alignment and bounds, header/footer mirroring,
    /// the predecessor-state bits, the absence of adjacent free blocks,
    /// bucket membership and link coherence, and the agreement between
    /// the implicit walk and the bucket population.
    ///
    /// Every public mutating operation asserts this in debug builds;
    /// tests call it directly. Violations are reported through
    /// `log::debug!`.
    pub fn check_heap(&self) -> bool {
        if !self.was_initialized() {
            return true;
        }

        let low = self.provider.low();
        let epilogue_addr = self.provider.high() + 1 - WORD_SIZE;

        unsafe {
            let prologue = Block::header_at(low).word();
            if prologue.size() != 0 || !prologue.self_alloc() {
                debug!("heap check: bad prologue encoding");
                return false;
            }
            let epilogue = Block::header_at(epilogue_addr).word();
            if epilogue.size() != 0 || !epilogue.self_alloc() {
                debug!("heap check: bad epilogue encoding");
                return false;
            }

            // the implicit walk carries the predecessor's state so the
            // packed bits of every block, epilogue included, can be
            // checked against the truth
            let mut addr = self.heap_start;
            let mut prev_alloc = true; // the prologue counts as allocated
            let mut prev_size = 0; // and is no minimum-size block
            let mut free_blocks = 0usize;

            loop {
                let word = Block::header_at(addr).word();
                let size = word.size();

                if word.prev_alloc() != prev_alloc {
                    debug!("heap check: stale prev-allocated bit at {:#x}", addr);
                    return false;
                }
                if word.prev_is_min() != (prev_size == MIN_BLOCK_SIZE) {
                    debug!("heap check: stale prev-is-min bit at {:#x}", addr);
                    return false;
                }

                if size == 0 {
                    if addr != epilogue_addr {
                        debug!("heap check: stray zero-size block at {:#x}", addr);
                        return false;
                    }
                    break;
                }

                if addr + size > epilogue_addr {
                    debug!("heap check: block at {:#x} runs past the heap", addr);
                    return false;
                }
                if (addr + HEADER_SIZE) % BLOCK_ALIGN != 0 || size % MIN_BLOCK_SIZE != 0 {
                    debug!("heap check: misaligned block at {:#x}", addr);
                    return false;
                }

                if !word.self_alloc() {
                    if !prev_alloc {
                        debug!("heap check: adjacent free blocks at {:#x}", addr);
                        return false;
                    }
                    if size > MIN_BLOCK_SIZE {
                        let footer = *((addr + size - WORD_SIZE) as *const HeaderWord);
                        if footer != word {
                            debug!("heap check: header/footer mismatch at {:#x}", addr);
                            return false;
                        }
                    }
                    free_blocks += 1;
                }

                prev_alloc = word.self_alloc();
                prev_size = size;
                addr += size;
            }

            let mut listed = 0usize;
            for index in 0..BUCKET_COUNT {
                match self.checked_bucket_len(index) {
                    Some(len) => listed += len,
                    None => return false,
                }
            }
            if listed != free_blocks {
                debug!(
                    "heap check: {} free blocks on the heap but {} on the buckets",
                    free_blocks, listed
                );
                return false;
            }
        }

        true
    }

    /// Validates one bucket and returns its population.
    unsafe fn checked_bucket_len(&self, index: usize) -> Option<usize> {
        let head = match self.directory.head(index) {
            Some(head) => head,
            None => return Some(0),
        };

        let low = self.provider.low();
        let epilogue_addr = self.provider.high() + 1 - WORD_SIZE;
        let lower = if index == 0 {
            0
        } else {
            BUCKET_UPPER_BOUNDS[index - 1]
        };
        let upper = BUCKET_UPPER_BOUNDS[index];

        let mut count = 0usize;
        let mut cur = head;
        loop {
            let block = &*cur.as_ptr();
            let addr = block.addr();
            if addr <= low || addr >= epilogue_addr {
                debug!("heap check: bucket {} holds a block outside the heap", index);
                return None;
            }
            if !block.header().is_free() {
                debug!("heap check: bucket {} holds an allocated block", index);
                return None;
            }
            let size = block.size();
            if size <= lower || size > upper {
                debug!("heap check: bucket {} holds a block of size {}", index, size);
                return None;
            }
            count += 1;

            if index == MIN_BUCKET {
                // chains of minimum-size blocks end in a self loop
                if block.next() == cur {
                    break;
                }
                cur = block.next();
            } else {
                let next = block.next();
                let prev = block.prev();
                if (*next.as_ptr()).prev() != cur || (*prev.as_ptr()).next() != cur {
                    debug!("heap check: bucket {} has inconsistent links", index);
                    return None;
                }
                if next == head {
                    break;
                }
                cur = next;
            }
        }
        Some(count)
    }
}
