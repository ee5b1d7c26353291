//! Power-of-two free-list engine behaviour, observed through the
//! counting page provider.

use kma::test_util::{stamped_class, MockProvider};
use kma::{P2fl, PAGE_SIZE};

fn pool() -> P2fl<MockProvider> {
    P2fl::with_provider(MockProvider::new())
}

#[test]
fn test_single_small_allocation() {
    let mut alloc = pool();
    let p = alloc.malloc(12);
    assert!(!p.is_null());
    assert_eq!(unsafe { stamped_class(p) }, 16);
    assert_eq!(alloc.live(), 1);

    unsafe { alloc.free(p, 12) };
    assert_eq!(alloc.live(), 0);
    assert_eq!(alloc.provider().outstanding(), 0);
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_first_page_serves_the_doubling_fill() {
    let mut alloc = pool();
    // The fresh first page carves two 16-byte buffers; the second
    // 16-request empties that list without growing the pool.
    let a = alloc.malloc(12);
    let b = alloc.malloc(12);
    assert_eq!(alloc.free_list_len(0), 0);
    let c = alloc.malloc(28);
    let d = alloc.malloc(60);
    for p in [a, b, c, d] {
        assert!(!p.is_null());
    }
    assert_eq!(unsafe { stamped_class(c) }, 32);
    assert_eq!(unsafe { stamped_class(d) }, 64);
    assert_eq!(alloc.provider().acquired(), 1);

    for (p, n) in [(a, 12), (b, 12), (c, 28), (d, 60)] {
        unsafe { alloc.free(p, n) };
    }
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_empty_class_is_served_whole_from_the_next_one() {
    let mut alloc = pool();
    let a = alloc.malloc(12);
    let b = alloc.malloc(12);
    // Both 16-byte buffers are gone; a third small request is handed a
    // whole 32-byte buffer rather than growing the pool.
    let c = alloc.malloc(12);
    assert_eq!(unsafe { stamped_class(c) }, 32);
    assert_eq!(alloc.provider().acquired(), 1);

    for p in [a, b, c] {
        unsafe { alloc.free(p, 12) };
    }
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_exact_fit_request_lands_in_its_class() {
    let mut alloc = pool();
    let mut held = Vec::new();
    // A request of class-size minus the header is served from exactly
    // that class on a fresh pool.
    for class in 0..=7u32 {
        let size = 16u32 << class;
        let p = alloc.malloc(size as usize - 4);
        assert!(!p.is_null());
        assert_eq!(unsafe { stamped_class(p) }, size);
        held.push((p, size as usize - 4));
    }
    for (p, n) in held {
        unsafe { alloc.free(p, n) };
    }
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_top_class_request_grows_a_dedicated_fill() {
    let mut alloc = pool();
    // Largest supported request: one page's usable bytes minus the
    // header.
    let top = PAGE_SIZE - 24;
    let p = alloc.malloc(top - 4);
    assert!(!p.is_null());
    assert_eq!(unsafe { stamped_class(p) } as usize, top);
    // The first page cannot host it, so a second page was carved.
    assert_eq!(alloc.provider().acquired(), 2);

    unsafe { alloc.free(p, top - 4) };
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_oversize_request_is_null_without_pages() {
    let mut alloc = pool();
    let top = PAGE_SIZE - 24;
    assert!(alloc.malloc(top - 3).is_null());
    assert_eq!(alloc.provider().acquired(), 0);
}

#[test]
fn test_drained_second_page_is_returned_early() {
    let mut alloc = pool();
    let a = alloc.malloc(12);
    // The first page carries two 2048-byte buffers; the third request
    // forces a second page.
    let b = alloc.malloc(2044);
    let c = alloc.malloc(2044);
    let d = alloc.malloc(2044);
    assert_eq!(alloc.provider().acquired(), 2);
    assert_eq!(alloc.stats().pages, 2);

    // Draining the second page hands it back while the pool stays up.
    unsafe { alloc.free(d, 2044) };
    assert_eq!(alloc.provider().released(), 1);
    assert_eq!(alloc.provider().outstanding(), 1);
    assert_eq!(alloc.stats().pages, 1);
    assert_eq!(alloc.live(), 3);
    // No free list may still reference the reclaimed page; the first
    // page had two 16-byte buffers of which one is out.
    assert_eq!(alloc.free_list_len(0), 1);

    for (p, n) in [(a, 12), (b, 2044), (c, 2044)] {
        unsafe { alloc.free(p, n) };
    }
    assert_eq!(alloc.provider().outstanding(), 0);
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_first_page_is_pinned_while_buffers_live_elsewhere() {
    let mut alloc = pool();
    let b = alloc.malloc(2044);
    let c = alloc.malloc(2044);
    let d = alloc.malloc(2044);
    assert_eq!(alloc.stats().pages, 2);
    // Drain the first page completely; it hosts the class table and
    // must stay.
    unsafe {
        alloc.free(b, 2044);
        alloc.free(c, 2044);
    }
    assert_eq!(alloc.stats().pages, 2);
    assert_eq!(alloc.live(), 1);

    unsafe { alloc.free(d, 2044) };
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_zero_byte_requests_get_distinct_pointers() {
    let mut alloc = pool();
    let p = alloc.malloc(0);
    let q = alloc.malloc(0);
    assert!(!p.is_null());
    assert!(!q.is_null());
    assert_ne!(p, q);
    assert_eq!(unsafe { stamped_class(p) }, 16);
    unsafe {
        alloc.free(p, 0);
        alloc.free(q, 0);
    }
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_provider_refusal_mid_growth_is_null() {
    let mut alloc = P2fl::with_provider(MockProvider::with_limit(1));
    let b = alloc.malloc(2044);
    let c = alloc.malloc(2044);
    assert!(!b.is_null());
    assert!(!c.is_null());
    // The next 2048-class request needs a page the provider refuses.
    assert!(alloc.malloc(2044).is_null());
    assert_eq!(alloc.live(), 2);

    unsafe {
        alloc.free(b, 2044);
        alloc.free(c, 2044);
    }
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_mixed_churn_leaves_the_pool_empty() {
    let mut alloc = pool();
    let sizes = [12usize, 100, 500, 1000, 12, 60, 2044, 300, 28, 4092];
    let mut held: Vec<(*mut u8, usize)> = Vec::new();
    for &n in &sizes {
        let p = alloc.malloc(n);
        assert!(!p.is_null());
        held.push((p, n));
    }
    assert_eq!(alloc.live(), sizes.len());

    // Free even indices first, then the rest.
    for &(p, n) in held.iter().step_by(2) {
        unsafe { alloc.free(p, n) };
    }
    for &(p, n) in held.iter().skip(1).step_by(2) {
        unsafe { alloc.free(p, n) };
    }
    assert_eq!(alloc.live(), 0);
    assert_eq!(alloc.provider().outstanding(), 0);
    assert!(alloc.stats().is_quiescent());
}

#[test]
fn test_pool_reinitialises_after_teardown() {
    let mut alloc = pool();
    let p = alloc.malloc(12);
    unsafe { alloc.free(p, 12) };
    assert!(alloc.stats().is_quiescent());

    let q = alloc.malloc(12);
    assert!(!q.is_null());
    assert_eq!(alloc.stats().pages, 1);
    unsafe { alloc.free(q, 12) };
    assert!(alloc.stats().is_quiescent());
}
