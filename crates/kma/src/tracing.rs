//! Allocator tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! events for the page lifecycle and the buddy coalescer. Without the
//! feature the helpers compile to empty inline stubs, so call sites stay
//! unconditional.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use std::io;

    pub fn pool_init(base: usize) {
        tracing::debug!(base = format_args!("{base:#x}"), "pool_init");
    }

    pub fn page_acquired(base: usize, total: u64) {
        tracing::debug!(base = format_args!("{base:#x}"), total, "page_acquired");
    }

    pub fn page_released(total: u64) {
        tracing::debug!(total, "page_released");
    }

    pub fn acquire_failed(err: &io::Error) {
        tracing::warn!(error = %err, "page_acquire_failed");
    }

    pub fn pool_teardown(pages: usize) {
        tracing::debug!(pages, "pool_teardown");
    }

    pub fn coalesced(new_size: usize) {
        tracing::trace!(new_size, "blocks_coalesced");
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    use std::io;

    #[inline]
    pub fn pool_init(_base: usize) {}

    #[inline]
    pub fn page_acquired(_base: usize, _total: u64) {}

    #[inline]
    pub fn page_released(_total: u64) {}

    #[inline]
    pub fn acquire_failed(_err: &io::Error) {}

    #[inline]
    pub fn pool_teardown(_pages: usize) {}

    #[inline]
    pub fn coalesced(_new_size: usize) {}
}

pub(crate) use internal::*;
