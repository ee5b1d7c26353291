//! Page registry and size-class table plumbing shared by both engines.
//!
//! All pool state lives inside the pages themselves: every owned page
//! starts with a [`PageHeader`] (provider handle, registry link, engine
//! metadata), and the first page additionally carries the [`ClassTable`]
//! right after its header. Free buffers are threaded into intrusive
//! singly-linked lists through their own first word.
//!
//! This module is the unsafe boundary: everything above it works in terms
//! of class indices and buffer addresses, everything below is raw pointer
//! arithmetic on page memory.

use std::io;
use std::mem;
use std::ptr;

use crate::layout::{base_of, MIN_BLOCK, NUM_CLASSES, PAGE_SIZE};
use crate::provider::{PageFrame, PageHandle, PageProvider};
use crate::tracing as trace;

/// Engine-specific metadata embedded in every page header.
pub(crate) trait PageMeta {
    /// Metadata for a freshly acquired page.
    fn fresh() -> Self;
}

/// Header installed at the base of every owned page.
#[repr(C)]
pub(crate) struct PageHeader<M> {
    /// Provider token, passed back on release.
    pub(crate) handle: PageHandle,
    /// Next page in acquisition order; null at the tail.
    pub(crate) next: *mut PageHeader<M>,
    /// Engine metadata: live-buffer count or occupancy bitmap.
    pub(crate) meta: M,
}

/// The size-class table, stored once on the first page.
///
/// `sizes[0..=8]` are 16..4096; `sizes[9]` is the engine's top class.
/// Each `heads[i]` is the head of the intrusive free list for class `i`.
#[repr(C)]
pub(crate) struct ClassTable {
    pub(crate) allocs: usize,
    pub(crate) sizes: [u32; NUM_CLASSES],
    pub(crate) heads: [*mut u8; NUM_CLASSES],
}

/// Bytes reserved by the class table.
pub(crate) const TABLE_BYTES: usize = mem::size_of::<ClassTable>();

/// Registry of owned pages plus the provider they came from.
pub(crate) struct Pool<P: PageProvider, M: PageMeta> {
    provider: P,
    head: *mut PageHeader<M>,
    pages_acquired: u64,
    pages_released: u64,
}

// The registry pointers reference memory owned exclusively by this pool;
// nothing in it is tied to the creating thread.
unsafe impl<P: PageProvider + Send, M: PageMeta> Send for Pool<P, M> {}

impl<P: PageProvider, M: PageMeta> Pool<P, M> {
    pub(crate) const fn new(provider: P) -> Self {
        Self {
            provider,
            head: ptr::null_mut(),
            pages_acquired: 0,
            pages_released: 0,
        }
    }

    pub(crate) const fn provider(&self) -> &P {
        &self.provider
    }

    pub(crate) fn ready(&self) -> bool {
        !self.head.is_null()
    }

    pub(crate) const fn first(&self) -> *mut PageHeader<M> {
        self.head
    }

    pub(crate) const fn pages_acquired(&self) -> u64 {
        self.pages_acquired
    }

    pub(crate) const fn pages_released(&self) -> u64 {
        self.pages_released
    }

    /// Pulls one frame from the provider, counting it.
    pub(crate) fn acquire_raw(&mut self) -> io::Result<PageFrame> {
        match self.provider.acquire() {
            Ok(frame) => {
                debug_assert_eq!(
                    frame.base.as_ptr() as usize % PAGE_SIZE,
                    0,
                    "provider frame is not page-aligned"
                );
                debug_assert_eq!(frame.size, PAGE_SIZE);
                self.pages_acquired += 1;
                trace::page_acquired(frame.base.as_ptr() as usize, self.pages_acquired);
                Ok(frame)
            }
            Err(err) => {
                trace::acquire_failed(&err);
                Err(err)
            }
        }
    }

    /// Returns one frame to the provider, counting it.
    ///
    /// # Safety
    ///
    /// `handle` must be an unreleased handle from this pool's provider,
    /// and no pointer into the frame may be used afterwards.
    pub(crate) unsafe fn release_raw(&mut self, handle: PageHandle) {
        self.pages_released += 1;
        trace::page_released(self.pages_released);
        unsafe { self.provider.release(handle) };
    }

    /// Writes a fresh page header onto an acquired frame.
    fn install_header(frame: &PageFrame) -> *mut PageHeader<M> {
        let page = frame.base.as_ptr().cast::<PageHeader<M>>();
        unsafe {
            page.write(PageHeader {
                handle: frame.handle,
                next: ptr::null_mut(),
                meta: M::fresh(),
            });
        }
        page
    }

    /// Acquires the first page and installs the class table on it.
    ///
    /// Returns `false` when the provider refuses; the pool stays usable
    /// and a later call may retry.
    pub(crate) fn init(&mut self, top_class: u32) -> bool {
        debug_assert!(self.head.is_null());
        let Ok(frame) = self.acquire_raw() else {
            return false;
        };
        let page = Self::install_header(&frame);
        let table = unsafe {
            frame
                .base
                .as_ptr()
                .add(mem::size_of::<PageHeader<M>>())
                .cast::<ClassTable>()
        };
        let mut sizes = [0u32; NUM_CLASSES];
        for (i, slot) in sizes.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                *slot = (MIN_BLOCK << i) as u32;
            }
        }
        sizes[NUM_CLASSES - 1] = top_class;
        unsafe {
            table.write(ClassTable {
                allocs: 0,
                sizes,
                heads: [ptr::null_mut(); NUM_CLASSES],
            });
        }
        self.head = page;
        trace::pool_init(page as usize);
        true
    }

    /// Appends a fresh page to the registry tail.
    pub(crate) fn grow(&mut self) -> Option<*mut PageHeader<M>> {
        debug_assert!(self.ready());
        let frame = self.acquire_raw().ok()?;
        let page = Self::install_header(&frame);
        unsafe {
            let mut tail = self.head;
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = page;
        }
        Some(page)
    }

    /// Unlinks one page from the registry and returns it to the provider.
    ///
    /// # Safety
    ///
    /// `page` must be in the registry and none of its buffers may be live
    /// or still on a free list.
    pub(crate) unsafe fn release_page(&mut self, page: *mut PageHeader<M>) {
        unsafe {
            if page == self.head {
                self.head = (*page).next;
            } else {
                let mut cur = self.head;
                while !cur.is_null() && (*cur).next != page {
                    cur = (*cur).next;
                }
                debug_assert!(!cur.is_null(), "release of unregistered page");
                if !cur.is_null() {
                    (*cur).next = (*page).next;
                }
            }
            let handle = (*page).handle;
            self.release_raw(handle);
        }
    }

    /// Returns every owned page to the provider and nulls the registry.
    pub(crate) fn release_all(&mut self) {
        let pages = self.page_count();
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next;
                let handle = (*cur).handle;
                self.release_raw(handle);
                cur = next;
            }
        }
        self.head = ptr::null_mut();
        trace::pool_teardown(pages);
    }

    pub(crate) fn page_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).next };
        }
        count
    }

    fn table_ptr(&self) -> *mut ClassTable {
        debug_assert!(self.ready());
        unsafe {
            self.head
                .cast::<u8>()
                .add(mem::size_of::<PageHeader<M>>())
                .cast::<ClassTable>()
        }
    }

    pub(crate) fn allocs(&self) -> usize {
        if self.ready() {
            unsafe { (*self.table_ptr()).allocs }
        } else {
            0
        }
    }

    pub(crate) fn add_alloc(&mut self) {
        unsafe { (*self.table_ptr()).allocs += 1 };
    }

    pub(crate) fn sub_alloc(&mut self) {
        unsafe {
            let table = self.table_ptr();
            debug_assert!((*table).allocs > 0, "free with no live buffers");
            (*table).allocs -= 1;
        }
    }

    pub(crate) fn size_of_class(&self, class: usize) -> u32 {
        unsafe { (*self.table_ptr()).sizes[class] }
    }

    /// Smallest class whose size fits `m`, or `None` when even the top
    /// class is too small.
    pub(crate) fn fit_class(&self, m: usize) -> Option<usize> {
        let table = self.table_ptr();
        (0..NUM_CLASSES).find(|&i| unsafe { (*table).sizes[i] as usize } >= m)
    }

    pub(crate) fn head_of(&self, class: usize) -> *mut u8 {
        unsafe { (*self.table_ptr()).heads[class] }
    }

    /// Pushes a free buffer onto the list whose class size is exactly
    /// `size`.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of an unused, word-aligned buffer of
    /// `size` bytes inside an owned page.
    pub(crate) unsafe fn push_free(&mut self, addr: *mut u8, size: u32) {
        let table = self.table_ptr();
        for i in 0..NUM_CLASSES {
            unsafe {
                if (*table).sizes[i] == size {
                    set_next(addr, (*table).heads[i]);
                    (*table).heads[i] = addr;
                    return;
                }
            }
        }
        debug_assert!(false, "free of off-class size {size}");
    }

    /// Pushes a buffer onto the top-class list regardless of its byte
    /// size. Used by the buddy engine for split residuals, which are
    /// shorter than the top class but still belong to it.
    ///
    /// # Safety
    ///
    /// Same as [`Self::push_free`].
    pub(crate) unsafe fn push_top(&mut self, addr: *mut u8) {
        let table = self.table_ptr();
        unsafe {
            set_next(addr, (*table).heads[NUM_CLASSES - 1]);
            (*table).heads[NUM_CLASSES - 1] = addr;
        }
    }

    /// Detaches and returns the head of a class list.
    pub(crate) fn pop_head(&mut self, class: usize) -> Option<*mut u8> {
        let table = self.table_ptr();
        unsafe {
            let head = (*table).heads[class];
            if head.is_null() {
                None
            } else {
                (*table).heads[class] = next_of(head);
                Some(head)
            }
        }
    }

    /// Unlinks a specific node from a class list. Returns `false` when
    /// the node is not on the list.
    ///
    /// # Safety
    ///
    /// The list must be well formed (acyclic, null-terminated).
    pub(crate) unsafe fn unlink(&mut self, class: usize, target: *mut u8) -> bool {
        let table = self.table_ptr();
        unsafe {
            let mut slot: *mut *mut u8 = ptr::addr_of_mut!((*table).heads[class]);
            while !(*slot).is_null() {
                let node = *slot;
                if node == target {
                    *slot = next_of(node);
                    return true;
                }
                slot = node.cast::<*mut u8>();
            }
        }
        false
    }

    /// Removes every free-list node living on the page at `page_base`,
    /// across all ten lists.
    ///
    /// # Safety
    ///
    /// The lists must be well formed.
    pub(crate) unsafe fn purge_page(&mut self, page_base: *mut u8) {
        let table = self.table_ptr();
        for class in 0..NUM_CLASSES {
            unsafe {
                let mut slot: *mut *mut u8 = ptr::addr_of_mut!((*table).heads[class]);
                while !(*slot).is_null() {
                    let node = *slot;
                    if base_of(node) == page_base {
                        *slot = next_of(node);
                    } else {
                        slot = node.cast::<*mut u8>();
                    }
                }
            }
        }
    }

    /// Length of a class free list. Test and stats aid.
    pub(crate) fn list_len(&self, class: usize) -> usize {
        if !self.ready() {
            return 0;
        }
        let mut count = 0;
        let mut node = self.head_of(class);
        while !node.is_null() {
            count += 1;
            node = unsafe { next_of(node) };
        }
        count
    }
}

impl<P: PageProvider, M: PageMeta> Drop for Pool<P, M> {
    fn drop(&mut self) {
        if self.ready() {
            self.release_all();
        }
    }
}

/// Page header owning the buffer at `addr`.
pub(crate) fn page_of<M>(addr: *mut u8) -> *mut PageHeader<M> {
    base_of(addr).cast::<PageHeader<M>>()
}

/// Reads the intrusive next pointer from a free buffer's first word.
pub(crate) unsafe fn next_of(node: *mut u8) -> *mut u8 {
    unsafe { node.cast::<*mut u8>().read() }
}

/// Writes the intrusive next pointer into a free buffer's first word.
pub(crate) unsafe fn set_next(node: *mut u8, next: *mut u8) {
    unsafe { node.cast::<*mut u8>().write(next) }
}
