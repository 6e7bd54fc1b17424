use core::ptr::NonNull;

use log::debug;

/// Supplies the contiguous heap region the allocator carves blocks from.
///
/// The region only ever grows. Calls are serialized with allocator state;
/// nothing else may hand out addresses inside the region.
pub trait PageProvider {
    /// Grows the heap by exactly `n` bytes and returns the base address of
    /// the new bytes, or `None` if the heap cannot grow.
    fn extend(&mut self, n: usize) -> Option<NonNull<u8>>;

    /// The lowest address of the heap region.
    fn low(&self) -> usize;

    /// The address of the last byte of the heap region, inclusive.
    fn high(&self) -> usize;
}

/// A provider serving a fixed region supplied by the caller.
///
/// Extension requests are honored until the region runs out, after which
/// they fail; the allocator then reports exhaustion to its caller. This is
/// the provider to use for embedding the allocator in a static buffer and
/// for tests.
pub struct BoundedHeap {
    start: usize,
    end: usize,
    brk: usize,
}

impl BoundedHeap {
    /// Creates a provider serving the `capacity` bytes at `start`.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for the lifetime of
    /// the provider and must not be used by anything else. `start` must be
    /// 16-byte aligned.
    pub unsafe fn new(start: *mut u8, capacity: usize) -> Self {
        let start = start as usize;
        Self {
            start,
            end: start + capacity,
            brk: start,
        }
    }
}

impl PageProvider for BoundedHeap {
    fn extend(&mut self, n: usize) -> Option<NonNull<u8>> {
        if self.end - self.brk < n {
            debug!(
                "bounded heap refusing extension of {} bytes ({} left)",
                n,
                self.end - self.brk
            );
            return None;
        }
        let base = self.brk;
        self.brk += n;
        Some(unsafe { NonNull::new_unchecked(base as *mut u8) })
    }

    fn low(&self) -> usize {
        self.start
    }

    fn high(&self) -> usize {
        self.brk - 1
    }
}

/// A provider that grows the process data segment through `sbrk`.
#[cfg(feature = "libc")]
pub struct Sbrk {
    base: usize,
    brk: usize,
}

#[cfg(feature = "libc")]
impl Sbrk {
    pub const fn new() -> Self {
        Self { base: 0, brk: 0 }
    }
}

#[cfg(feature = "libc")]
impl Default for Sbrk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "libc")]
impl PageProvider for Sbrk {
    fn extend(&mut self, n: usize) -> Option<NonNull<u8>> {
        // sbrk returns the previous break, which is the base of the new
        // region, or -1 when the kernel refuses.
        let prev = unsafe { libc::sbrk(n as libc::intptr_t) };
        if prev as isize == -1 {
            debug!("sbrk refused an extension of {} bytes", n);
            return None;
        }
        let base = prev as usize;
        if self.base == 0 {
            self.base = base;
        }
        self.brk = base + n;
        Some(unsafe { NonNull::new_unchecked(base as *mut u8) })
    }

    fn low(&self) -> usize {
        self.base
    }

    fn high(&self) -> usize {
        self.brk - 1
    }
}
