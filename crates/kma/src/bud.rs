//! Binary buddy engine.
//!
//! Every page reserves the same header and table span, so buffer offsets
//! within the usable region are page-independent and a block's buddy sits
//! at `offset ^ size`. An occupancy bitmap on each page records which
//! 16-byte slots belong to live buffers; a freed block coalesces with its
//! buddy only while the bitmap shows the buddy fully clear *and* the
//! buddy is actually parked on its class list.
//!
//! The top class is the whole usable region and is not a power of two:
//! splitting it yields a single 4096 lower buddy, and the short residual
//! goes back on the top list where it stays until teardown. Residuals
//! are told apart from full top blocks by their non-zero offset and are
//! never split or served.
//!
//! Requests beyond the top class take a dedicated page with the provider
//! handle embedded at its base; such pages never join the registry.

use std::cmp;
use std::mem;
use std::ptr::{self, NonNull};

use crate::bitmap::Occupancy;
use crate::header;
use crate::layout::{HEADER_BYTES, MIN_BLOCK, NUM_CLASSES, PAGE_SIZE, TOP_CLASS_INDEX};
use crate::pool::{self, next_of, PageHeader, PageMeta, Pool, TABLE_BYTES};
use crate::provider::{PageHandle, PageProvider, SysProvider};
use crate::stats::PoolStats;
use crate::tracing as trace;
use crate::KernelAlloc;

impl PageMeta for Occupancy {
    fn fresh() -> Self {
        Self::new()
    }
}

/// Bytes reserved by the page header, bitmap included.
const HDR_BYTES: usize = mem::size_of::<PageHeader<Occupancy>>();

/// Offset of slot 0: header plus table span, reserved on every page so
/// bitmap indices line up across pages.
const USABLE_OFFSET: usize = HDR_BYTES + TABLE_BYTES;

/// The top class: a page's usable bytes after header and table.
#[allow(clippy::cast_possible_truncation)]
const TOP_CLASS: u32 = (PAGE_SIZE - USABLE_OFFSET) as u32;

/// Bytes of the provider handle embedded at the base of a dedicated
/// large-allocation page.
const HANDLE_BYTES: usize = mem::size_of::<PageHandle>();

/// Binary buddy allocator over a [`PageProvider`].
pub struct Buddy<P: PageProvider = SysProvider> {
    pool: Pool<P, Occupancy>,
}

impl Buddy<SysProvider> {
    /// Creates an allocator backed by OS page mappings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(SysProvider::new())
    }
}

impl Default for Buddy<SysProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageProvider> Buddy<P> {
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

    /// Number of outstanding buffers in the main pool. Dedicated
    /// large-allocation pages are not counted.
    pub fn live(&self) -> usize {
        self.pool.allocs()
    }

    /// Snapshot of pool counters. Dedicated large-allocation pages show
    /// up only in the acquire/release totals.
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

    /// Total busy bitmap slots across all registry pages.
    #[doc(hidden)]
    pub fn busy_slots(&self) -> usize {
        let mut total = 0;
        let mut page = self.pool.first();
        while !page.is_null() {
            unsafe {
                total += (*page).meta.busy_count();
                page = (*page).next;
            }
        }
        total
    }

    /// Allocates `n` bytes. Requests beyond the top class take a
    /// dedicated page; returns null when even that cannot hold the
    /// request or the provider is exhausted.
    pub fn malloc(&mut self, n: usize) -> *mut u8 {
        let m = n + HEADER_BYTES;
        if m > TOP_CLASS as usize {
            return self.malloc_large(m);
        }
        if !self.ensure_pool() {
            return ptr::null_mut();
        }
        if let Some(p) = unsafe { self.take_block(m) } {
            return p.as_ptr();
        }
        let Some(page) = self.pool.grow() else {
            return ptr::null_mut();
        };
        unsafe { self.pool.push_free(page.cast::<u8>().add(USABLE_OFFSET), TOP_CLASS) };
        unsafe { self.take_block(m) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Releases a buffer returned by [`Self::malloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `malloc` on this allocator and
    /// not freed since, and `n` must be the size originally requested:
    /// it is what routes a dedicated large page back to the provider.
    pub unsafe fn free(&mut self, ptr: *mut u8, n: usize) {
        if n + HEADER_BYTES > TOP_CLASS as usize {
            // Dedicated page: the handle sits just before the buffer.
            unsafe {
                let handle = PageHandle(ptr.sub(HANDLE_BYTES).cast::<usize>().read());
                self.pool.release_raw(handle);
            }
            return;
        }
        let block = unsafe { ptr.sub(HEADER_BYTES) };
        let class_size = unsafe { header::read_class(block) } as usize;
        unsafe {
            self.mark_slots(block, class_size, false);
            let (block, merged_size) = self.coalesce(block, class_size);
            #[allow(clippy::cast_possible_truncation)]
            self.pool.push_free(block, merged_size as u32);
        }
        self.pool.sub_alloc();
        if self.pool.allocs() == 0 {
            self.pool.release_all();
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
        unsafe { self.pool.push_free(first.add(USABLE_OFFSET), TOP_CLASS) };
        true
    }

    fn malloc_large(&mut self, m: usize) -> *mut u8 {
        let Ok(frame) = self.pool.acquire_raw() else {
            return ptr::null_mut();
        };
        if m + HANDLE_BYTES > frame.size {
            unsafe { self.pool.release_raw(frame.handle) };
            return ptr::null_mut();
        }
        let base = frame.base.as_ptr();
        unsafe {
            base.cast::<usize>().write(frame.handle.0);
            base.add(HANDLE_BYTES)
        }
    }

    /// Serves `m` bytes, splitting larger blocks down as needed.
    ///
    /// # Safety
    ///
    /// The pool must be initialised.
    unsafe fn take_block(&mut self, m: usize) -> Option<NonNull<u8>> {
        let fit = self.pool.fit_class(m)?;
        // Find the lowest stocked class at or above the fit. The top
        // class only counts when it holds a full block.
        let mut class = fit;
        loop {
            if class == NUM_CLASSES {
                return None;
            }
            let stocked = if class == TOP_CLASS_INDEX {
                self.find_full_top().is_some()
            } else {
                !self.pool.head_of(class).is_null()
            };
            if stocked {
                break;
            }
            class += 1;
        }
        // Split downward until the fit class has a block.
        while class > fit {
            let half = self.pool.size_of_class(class - 1);
            if class == TOP_CLASS_INDEX {
                // The top block is not a clean power of two: it yields
                // one lower buddy, and the short remainder stays on the
                // top list as-is.
                let block = unsafe { self.take_full_top() }?;
                unsafe {
                    self.pool.push_free(block, half);
                    self.pool.push_top(block.add(half as usize));
                }
            } else {
                let block = self.pool.pop_head(class)?;
                unsafe {
                    self.pool.push_free(block.add(half as usize), half);
                    self.pool.push_free(block, half);
                }
            }
            class -= 1;
        }
        let block = if fit == TOP_CLASS_INDEX {
            unsafe { self.take_full_top() }?
        } else {
            self.pool.pop_head(fit)?
        };
        let class_size = self.pool.size_of_class(fit);
        unsafe {
            header::write_class(block, class_size);
            self.mark_slots(block, class_size as usize, true);
        }
        self.pool.add_alloc();
        let user = unsafe { block.add(HEADER_BYTES) };
        debug_assert_eq!(user as usize % 4, 0);
        NonNull::new(user)
    }

    /// First full-sized block on the top list, if any. Residuals sit at
    /// a non-zero usable offset and do not qualify.
    fn find_full_top(&self) -> Option<*mut u8> {
        let mut node = self.pool.head_of(TOP_CLASS_INDEX);
        while !node.is_null() {
            if usable_offset(node) == 0 {
                return Some(node);
            }
            node = unsafe { next_of(node) };
        }
        None
    }

    /// Unlinks and returns the first full-sized block on the top list.
    ///
    /// # Safety
    ///
    /// The pool must be initialised.
    unsafe fn take_full_top(&mut self) -> Option<*mut u8> {
        let block = self.find_full_top()?;
        let unlinked = unsafe { self.pool.unlink(TOP_CLASS_INDEX, block) };
        debug_assert!(unlinked);
        Some(block)
    }

    /// Merges `block` upward with free buddies. Returns the final block
    /// and size.
    ///
    /// # Safety
    ///
    /// `block` must be an off-list buffer of `size` bytes whose bitmap
    /// slots are already clear.
    unsafe fn coalesce(&mut self, mut block: *mut u8, mut size: usize) -> (*mut u8, usize) {
        while 2 * size <= TOP_CLASS as usize {
            let page = pool::page_of::<Occupancy>(block);
            let offset = usable_offset(block);
            debug_assert_eq!(offset % size, 0);
            let buddy_offset = offset ^ size;
            let buddy = unsafe { page.cast::<u8>().add(USABLE_OFFSET + buddy_offset) };
            // The bitmap rules out buddies that are live or partly
            // carved up; the list walk rules out buddies merged into a
            // block of a different size.
            let clear = unsafe {
                (*page)
                    .meta
                    .all_clear(buddy_offset / MIN_BLOCK, (buddy_offset + size) / MIN_BLOCK)
            };
            if !clear {
                break;
            }
            let Some(class) = self.pool.fit_class(size) else {
                break;
            };
            if !unsafe { self.pool.unlink(class, buddy) } {
                break;
            }
            block = cmp::min(block, buddy);
            size *= 2;
            trace::coalesced(size);
        }
        (block, size)
    }

    /// Sets or clears the bitmap slots covering a block.
    ///
    /// # Safety
    ///
    /// `block` must lie in the usable region of an owned page.
    unsafe fn mark_slots(&mut self, block: *mut u8, size: usize, busy: bool) {
        let page = pool::page_of::<Occupancy>(block);
        let offset = usable_offset(block);
        let first = offset / MIN_BLOCK;
        let end = (offset + size) / MIN_BLOCK;
        unsafe {
            if busy {
                (*page).meta.set_range(first, end);
            } else {
                (*page).meta.clear_range(first, end);
            }
        }
    }
}

/// Offset of a buffer from slot 0 of its page.
fn usable_offset(block: *mut u8) -> usize {
    (block as usize & !crate::layout::PAGE_MASK) - USABLE_OFFSET
}

impl<P: PageProvider> KernelAlloc for Buddy<P> {
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
