//! Malloc/free churn through both engines.

use criterion::{criterion_group, criterion_main, Criterion};
use kma::{Buddy, KernelAlloc, P2fl};

const SLOTS: usize = 32;

fn churn<A: KernelAlloc>(pool: &mut A) {
    let mut held = [std::ptr::null_mut::<u8>(); SLOTS];
    for (i, slot) in held.iter_mut().enumerate() {
        *slot = pool.malloc(16 + i * 24);
    }
    for (i, &p) in held.iter().enumerate() {
        unsafe { pool.free(p, 16 + i * 24) };
    }
}

fn bench_churn(c: &mut Criterion) {
    c.bench_function("p2fl_churn", |b| {
        let mut pool = P2fl::new();
        b.iter(|| churn(&mut pool));
    });

    c.bench_function("buddy_churn", |b| {
        let mut pool = Buddy::new();
        b.iter(|| churn(&mut pool));
    });
}

criterion_group!(benches, bench_churn);
criterion_main!(benches);
