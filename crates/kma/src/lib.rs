//! A kernel-style pool allocator over fixed-size page frames.
//!
//! `kma` serves requests of arbitrary byte sizes out of 8 KiB pages
//! pulled from a [`PageProvider`]. Two engines implement the same
//! contract:
//!
//! - [`P2fl`] — **power-of-two free lists** with per-page live counts;
//!   drained pages are returned to the provider early.
//! - [`Buddy`] — **binary buddy** splitting and coalescing, driven by a
//!   per-page occupancy bitmap, with a dedicated-page escape hatch for
//!   requests larger than a page's usable region.
//!
//! Both stamp each buffer with an inline 4-byte class header, so `free`
//! recovers the buffer's class without any lookup structure, and both
//! tear the whole pool down the moment the last buffer is returned.
//!
//! # Quick start
//!
//! ```
//! use kma::Buddy;
//!
//! let mut pool = Buddy::new();
//! let p = pool.malloc(100);
//! assert!(!p.is_null());
//! unsafe { pool.free(p, 100) };
//! assert_eq!(pool.live(), 0);
//! ```
//!
//! # The process-wide pool
//!
//! A lazily created [`P2fl`] behind a mutex backs the free-function API:
//!
//! ```
//! let p = kma::malloc(24);
//! assert!(!p.is_null());
//! unsafe { kma::free(p, 24) };
//! ```
//!
//! # Contract
//!
//! The engines are not re-entrant and assume one call at a time; the
//! process-wide pool serialises through its mutex, instances must be
//! serialised by their owner. Double frees and foreign pointers are
//! undefined behaviour, caught only by debug assertions.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

mod bitmap;
mod bud;
mod header;
mod p2fl;
mod pool;
mod provider;
mod stats;
mod tracing;

/// Geometry constants: page size, class layout, pointer masking.
pub mod layout;

#[doc(hidden)]
pub mod test_util;

pub use bud::Buddy;
pub use layout::{HEADER_BYTES, MIN_BLOCK, NUM_CLASSES, PAGE_SIZE};
pub use p2fl::P2fl;
pub use provider::{PageFrame, PageHandle, PageProvider, SysProvider};
pub use stats::PoolStats;

use parking_lot::Mutex;

/// The contract both engines implement.
pub trait KernelAlloc {
    /// Allocates `n` bytes, returning null on failure. The result is
    /// 4-byte aligned and stays valid until the matching [`free`].
    ///
    /// [`free`]: KernelAlloc::free
    fn malloc(&mut self, n: usize) -> *mut u8;

    /// Releases a buffer from [`malloc`]. `n` must be the originally
    /// requested size; engines use it at most to recognise oversize
    /// buffers.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `malloc` on this same allocator and must not
    /// have been freed already.
    ///
    /// [`malloc`]: KernelAlloc::malloc
    unsafe fn free(&mut self, ptr: *mut u8, n: usize);

    /// Number of outstanding buffers.
    fn live(&self) -> usize;

    /// Snapshot of the pool counters.
    fn stats(&self) -> PoolStats;
}

/// The engine behind [`malloc`] / [`free`].
pub type DefaultAlloc = P2fl<SysProvider>;

static DEFAULT_POOL: Mutex<Option<DefaultAlloc>> = Mutex::new(None);

/// Runs `f` against the process-wide allocator, creating it on first
/// use.
pub fn with_default<R>(f: impl FnOnce(&mut DefaultAlloc) -> R) -> R {
    let mut guard = DEFAULT_POOL.lock();
    f(guard.get_or_insert_with(P2fl::new))
}

/// Allocates `n` bytes from the process-wide pool. Returns null when the
/// request cannot be satisfied.
pub fn malloc(n: usize) -> *mut u8 {
    with_default(|pool| pool.malloc(n))
}

/// Releases a buffer obtained from [`malloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`malloc`] and not freed since.
pub unsafe fn free(ptr: *mut u8, n: usize) {
    with_default(|pool| unsafe { pool.free(ptr, n) });
}
