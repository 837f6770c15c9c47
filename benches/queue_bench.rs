use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Instant;

use anamnesis::Queue;

fn single_thread(c: &mut Criterion) {
    let queue: Queue<u64> = Queue::new(1024).expect("queue creation failed");

    c.bench_function("queue_push_pop", |b| {
        b.iter(|| {
            let _ = queue.push(black_box(42));
            let _ = black_box(queue.pop());
        })
    });
}

fn mpmc(c: &mut Criterion) {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 2;

    let queue: Queue<u64> = Queue::new(4096).expect("queue creation failed");

    c.bench_function("queue_mpmc_2p2c", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            std::thread::scope(|s| {
                for _ in 0..PRODUCERS {
                    s.spawn(|| {
                        for i in 0..iters {
                            while queue.push(i).is_none() {
                                std::thread::yield_now();
                            }
                        }
                    });
                }
                for _ in 0..CONSUMERS {
                    s.spawn(|| {
                        let mut remaining = iters as i64;
                        while remaining > 0 {
                            if queue.pop().is_some() {
                                remaining -= 1;
                            } else {
                                std::thread::yield_now();
                            }
                        }
                    });
                }
            });
            start.elapsed()
        })
    });
}

criterion_group!(benches, single_thread, mpmc);
criterion_main!(benches);