//! Power-of-two free-list engine.
//!
//! Buffers are served whole from the smallest stocked class that fits;
//! classes are never split, so a request only grows the pool when every
//! class at or above its fit is empty. New pages are carved into
//! free-list buffers up front, with the carving pattern picked by the
//! request that forced the growth. Each page counts its live buffers so
//! that drained pages (other than the first, which hosts the class
//! table) can be returned to the provider early.

use std::mem;
use std::ptr::{self, NonNull};

use crate::header;
use crate::layout::{HEADER_BYTES, MIN_BLOCK, NUM_CLASSES, PAGE_SIZE, TOP_CLASS_INDEX};
use crate::pool::{self, PageHeader, PageMeta, Pool, TABLE_BYTES};
use crate::provider::{PageProvider, SysProvider};
use crate::stats::PoolStats;
use crate::KernelAlloc;

/// Per-page live-buffer count.
pub(crate) struct PageLive {
    live: usize,
}

impl PageMeta for PageLive {
    fn fresh() -> Self {
        Self { live: 0 }
    }
}

/// Bytes reserved by the page header.
const HDR_BYTES: usize = mem::size_of::<PageHeader<PageLive>>();

/// The top class: a page's usable bytes after its header.
#[allow(clippy::cast_possible_truncation)]
const TOP_CLASS: u32 = (PAGE_SIZE - HDR_BYTES) as u32;

/// Carving pattern for a fresh page, selected by the request size that
/// forced the page acquisition.
#[derive(Clone, Copy, PartialEq, Eq)]
enum PageFill {
    /// Doubling ladder from 16 up, then greedy halving backfill.
    Normal,
    /// Greedy fill from 4096 down.
    Big,
    /// One top-class buffer, then greedy fill from 4096 down.
    Huge,
}

impl PageFill {
    fn for_request(m: usize) -> Self {
        if m <= 2048 {
            Self::Normal
        } else if m <= 4096 {
            Self::Big
        } else {
            Self::Huge
        }
    }
}

/// Power-of-two free-list allocator over a [`PageProvider`].
pub struct P2fl<P: PageProvider = SysProvider> {
    pool: Pool<P, PageLive>,
}

impl P2fl<SysProvider> {
    /// Creates an allocator backed by OS page mappings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(SysProvider::new())
    }
}

impl Default for P2fl<SysProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageProvider> P2fl<P> {
    /// Creates an allocator over a custom page provider.
    pub const fn with_provider(provider: P) -> Self {
        Self {
            pool: Pool::new(provider),
        }
    }

    /// The page provider, for inspection.
    pub const fn provider(&self) -> &P {
        self.pool.provider()
    }

    /// Number of outstanding buffers.
    pub fn live(&self) -> usize {
        self.pool.allocs()
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_buffers: self.pool.allocs(),
            pages: self.pool.page_count(),
            pages_acquired: self.pool.pages_acquired(),
            pages_released: self.pool.pages_released(),
        }
    }

    #[doc(hidden)]
    pub fn free_list_len(&self, class: usize) -> usize {
        self.pool.list_len(class)
    }

    /// Allocates `n` bytes. Returns null when the request exceeds the top
    /// class or the provider is exhausted.
    pub fn malloc(&mut self, n: usize) -> *mut u8 {
        let m = n + HEADER_BYTES;
        if m > TOP_CLASS as usize {
            return ptr::null_mut();
        }
        if !self.ensure_pool() {
            return ptr::null_mut();
        }
        if let Some(p) = self.alloc_from_lists(m) {
            return p.as_ptr();
        }
        // Miss: grow by one page carved for this request class, then
        // retry once.
        let Some(page) = self.pool.grow() else {
            return ptr::null_mut();
        };
        unsafe { self.carve(page.cast::<u8>(), HDR_BYTES, PageFill::for_request(m)) };
        self.alloc_from_lists(m)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Releases a buffer returned by [`Self::malloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `malloc` on this allocator and
    /// not freed since. `n` is advisory and unused by this engine.
    pub unsafe fn free(&mut self, ptr: *mut u8, n: usize) {
        let _ = n;
        let block = unsafe { ptr.sub(HEADER_BYTES) };
        let class_size = unsafe { header::read_class(block) };
        unsafe { self.pool.push_free(block, class_size) };
        self.pool.sub_alloc();
        let page = pool::page_of::<PageLive>(block);
        unsafe {
            debug_assert!((*page).meta.live > 0, "free on a drained page");
            (*page).meta.live -= 1;
        }
        if self.pool.allocs() == 0 {
            self.pool.release_all();
        } else if unsafe { (*page).meta.live } == 0 && page != self.pool.first() {
            // The page has drained but the pool is still in use: give
            // just this page back. The first page is pinned by the
            // class table.
            unsafe {
                self.pool.purge_page(page.cast::<u8>());
                self.pool.release_page(page);
            }
        }
    }

    fn ensure_pool(&mut self) -> bool {
        if self.pool.ready() {
            return true;
        }
        if !self.pool.init(TOP_CLASS) {
            return false;
        }
        let first = self.pool.first().cast::<u8>();
        unsafe { self.carve(first, HDR_BYTES + TABLE_BYTES, PageFill::Normal) };
        true
    }

    /// Serves `m` bytes from the lists: the first stocked class at or
    /// above the fit hands over its head buffer whole.
    fn alloc_from_lists(&mut self, m: usize) -> Option<NonNull<u8>> {
        let fit = self.pool.fit_class(m)?;
        for class in fit..NUM_CLASSES {
            if let Some(block) = self.pool.pop_head(class) {
                let class_size = self.pool.size_of_class(class);
                unsafe {
                    header::write_class(block, class_size);
                    let page = pool::page_of::<PageLive>(block);
                    (*page).meta.live += 1;
                }
                self.pool.add_alloc();
                let user = unsafe { block.add(HEADER_BYTES) };
                debug_assert_eq!(user as usize % 4, 0);
                return NonNull::new(user);
            }
        }
        None
    }

    fn class_size(class: usize) -> usize {
        if class == TOP_CLASS_INDEX {
            TOP_CLASS as usize
        } else {
            MIN_BLOCK << class
        }
    }

    /// Partitions a page's usable region `[start, PAGE_SIZE)` into
    /// free-list buffers.
    ///
    /// # Safety
    ///
    /// `base` must be an owned page whose region past `start` holds no
    /// live data.
    unsafe fn carve(&mut self, base: *mut u8, start: usize, fill: PageFill) {
        let mut cur = start;
        let descend_from = match fill {
            PageFill::Normal => {
                // One buffer of each class, doubling upward while it
                // still fits.
                let mut class = 0;
                while class < NUM_CLASSES {
                    let size = Self::class_size(class);
                    if cur + size > PAGE_SIZE {
                        break;
                    }
                    #[allow(clippy::cast_possible_truncation)]
                    unsafe {
                        self.pool.push_free(base.add(cur), size as u32);
                    }
                    cur += size;
                    class += 1;
                }
                class.saturating_sub(1)
            }
            PageFill::Big => TOP_CLASS_INDEX - 1,
            PageFill::Huge => {
                let size = TOP_CLASS as usize;
                if cur + size <= PAGE_SIZE {
                    unsafe { self.pool.push_free(base.add(cur), TOP_CLASS) };
                    cur += size;
                }
                TOP_CLASS_INDEX - 1
            }
        };
        // Backfill what remains, largest class first, until nothing
        // below 16 bytes is left over.
        for class in (0..=descend_from).rev() {
            let size = Self::class_size(class);
            while cur + size <= PAGE_SIZE {
                #[allow(clippy::cast_possible_truncation)]
                unsafe {
                    self.pool.push_free(base.add(cur), size as u32);
                }
                cur += size;
            }
        }
    }
}

impl<P: PageProvider> KernelAlloc for P2fl<P> {
    fn malloc(&mut self, n: usize) -> *mut u8 {
        Self::malloc(self, n)
    }

    unsafe fn free(&mut self, ptr: *mut u8, n: usize) {
        unsafe { Self::free(self, ptr, n) }
    }

    fn live(&self) -> usize {
        Self::live(self)
    }

    fn stats(&self) -> PoolStats {
        Self::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockProvider;

    #[test]
    fn test_first_page_doubling_layout() {
        let mut alloc = P2fl::with_provider(MockProvider::new());
        let p = alloc.malloc(12);
        assert!(!p.is_null());
        // 8 KiB minus header and table fits two buffers of most small
        // classes and one 128.
        assert_eq!(alloc.free_list_len(0), 1);
        assert_eq!(alloc.free_list_len(1), 2);
        assert_eq!(alloc.free_list_len(3), 1);
        assert_eq!(alloc.free_list_len(7), 2);
        assert_eq!(alloc.free_list_len(8), 0);
        unsafe { alloc.free(p, 12) };
    }

    #[test]
    fn test_oversize_is_rejected_before_growing() {
        let mut alloc = P2fl::with_provider(MockProvider::new());
        assert!(alloc.malloc(PAGE_SIZE).is_null());
        assert_eq!(alloc.provider().acquired(), 0);
    }

    #[test]
    fn test_provider_refusal_surfaces_as_null() {
        let mut alloc = P2fl::with_provider(MockProvider::with_limit(0));
        assert!(alloc.malloc(12).is_null());
    }
}
