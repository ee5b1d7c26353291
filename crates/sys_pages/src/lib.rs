//! Anonymous page-frame mappings for pool allocators.
//!
//! `sys_pages` wraps the platform's raw page machinery (`mmap` on unix,
//! `VirtualAlloc` on windows) in an RAII handle sized for allocators that
//! manage memory a page frame at a time. Mappings are always anonymous,
//! readable and writable, and are returned to the OS on drop.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KB; on Unix it equals the page size.
/// Mapped regions start on a boundary of this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous memory mapping.
///
/// The region is unmapped when the handle is dropped.
pub struct PageMap {
    inner: os::MapInner,
}

impl PageMap {
    /// Returns a pointer to the start of the mapped region.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    ///
    /// Zero-length mappings cannot be created through [`MapOptions`], so
    /// this is always `false` for a live handle.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

/// Configuration for creating an anonymous mapping.
#[derive(Debug, Clone)]
pub struct MapOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl MapOptions {
    /// Creates a new `MapOptions` with length 0.
    /// A length must be set before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip swap-space reservation (on supported
    /// platforms).
    ///
    /// On Linux this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous mapping of the configured length.
    ///
    /// # Errors
    ///
    /// Returns an error when the length is zero or the OS refuses the
    /// mapping.
    ///
    /// # Safety
    ///
    /// The mapping itself is owned and valid for the lifetime of the
    /// returned [`PageMap`], but this crate hands out raw pointers into
    /// it; the caller is responsible for not using those pointers after
    /// the handle is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<PageMap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MapInner::map_anon(self.len, self.populate, self.no_reserve)? };
        Ok(PageMap { inner })
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be a power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "granularity should be a power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let map = unsafe {
            MapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = map.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert_eq!(map.len(), len);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_multi_page_map() {
        let len = page_size() * 4;
        let map = unsafe {
            MapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        // Touch the first and last byte of the region.
        unsafe {
            ptr::write_volatile(map.ptr(), 1);
            ptr::write_volatile(map.ptr().add(len - 1), 2);
            assert_eq!(ptr::read_volatile(map.ptr()), 1);
            assert_eq!(ptr::read_volatile(map.ptr().add(len - 1)), 2);
        }
    }

    #[test]
    fn test_zero_len_rejected() {
        let err = unsafe { MapOptions::new().map_anon() };
        assert!(err.is_err());
    }

    #[test]
    fn test_populate_and_no_reserve() {
        // Flag plumbing only; both are advisory on most platforms.
        let map = unsafe {
            MapOptions::new()
                .len(page_size())
                .populate(true)
                .no_reserve(true)
                .map_anon()
                .expect("failed to map")
        };
        assert!(!map.ptr().is_null());
    }
}
