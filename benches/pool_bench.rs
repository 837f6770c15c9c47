use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Instant;

use anamnesis::{Pool, PoolConfig};

fn uncontended(c: &mut Criterion) {
    let pool = Pool::new(PoolConfig {
        slot_size: 64,
        slot_count: 1024,
        ..Default::default()
    })
    .expect("pool creation failed");

    c.bench_function("pool_alloc_release", |b| {
        b.iter(|| {
            let h = pool.alloc();
            black_box(h);
            pool.release(h);
        })
    });

    let h = pool.alloc();
    c.bench_function("pool_get_valid", |b| {
        b.iter(|| black_box(pool.get(black_box(h))))
    });

    let stale = h;
    pool.release(h);
    let _live = pool.alloc();
    c.bench_function("pool_get_stale", |b| {
        b.iter(|| black_box(pool.get(black_box(stale))))
    });
}

fn contended(c: &mut Criterion) {
    const THREADS: usize = 4;

    let pool = Pool::new(PoolConfig {
        slot_size: 64,
        slot_count: 4096,
        ..Default::default()
    })
    .expect("pool creation failed");

    c.bench_function("pool_churn_4_threads", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            std::thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        for _ in 0..iters {
                            let h = pool.alloc();
                            if !h.is_null() {
                                pool.release(h);
                            }
                        }
                    });
                }
            });
            start.elapsed()
        })
    });
}

criterion_group!(benches, uncontended, contended);
criterion_main!(benches);
