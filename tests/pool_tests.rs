use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use anamnesis::{Handle, Pool, PoolConfig, PoolError, STATE_FREE, STATE_LIVE};

fn small_pool(slot_count: usize) -> Pool {
    Pool::new(PoolConfig {
        slot_size: 64,
        slot_count,
        ..Default::default()
    })
    .expect("pool creation failed")
}

#[test]
fn create_with_defaults() {
    let pool = Pool::new(PoolConfig::default()).expect("pool creation failed");
    let stats = pool.stats();
    assert_eq!(stats.slot_count, 1024);
    assert_eq!(stats.slots_free, 1024);
    assert_eq!(stats.slots_live, 0);
    assert_eq!(stats.anamnesis_count, 0);
    assert_eq!(stats.generation_max, 0);
}

#[test]
fn rejects_bad_config() {
    let bad_size = Pool::new(PoolConfig {
        slot_size: 0,
        ..Default::default()
    });
    assert_eq!(bad_size.err(), Some(PoolError::ZeroSlotSize));

    let bad_count = Pool::new(PoolConfig {
        slot_count: 0,
        ..Default::default()
    });
    assert_eq!(bad_count.err(), Some(PoolError::ZeroSlotCount));

    let below_min = Pool::new(PoolConfig {
        alignment: 4,
        ..Default::default()
    });
    assert_eq!(below_min.err(), Some(PoolError::BadAlignment(4)));

    let not_pow2 = Pool::new(PoolConfig {
        alignment: 24,
        ..Default::default()
    });
    assert_eq!(not_pow2.err(), Some(PoolError::BadAlignment(24)));

    // Alignment 0 selects the default of 8.
    let defaulted = Pool::new(PoolConfig {
        alignment: 0,
        ..Default::default()
    })
    .expect("alignment 0 should default");
    assert!(!defaulted.alloc().is_null());
}

#[test]
fn alloc_release_cycle() {
    let pool = small_pool(10);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let h = pool.alloc();
        assert!(!h.is_null(), "allocation failed");
        assert_eq!(h.state(), STATE_LIVE);
        handles.push(h);
    }

    // Exhausted: the null handle comes back and no counter moves.
    let extra = pool.alloc();
    assert!(extra.is_null());
    let stats = pool.stats();
    assert_eq!(stats.alloc_count, 10);
    assert_eq!(stats.slots_free, 0);
    assert_eq!(stats.anamnesis_count, 0);

    assert!(pool.release(handles[0]));

    let again = pool.alloc();
    assert!(!again.is_null());
    assert_eq!(again.generation(), 1, "generation should increment");
    assert_eq!(again.addr(), handles[0].addr(), "LIFO reuse expected");
}

#[test]
fn stale_handle_exposed() {
    let pool = small_pool(10);

    let h1 = pool.alloc();
    assert_eq!(h1.generation(), 0);
    assert!(pool.validate(h1));

    assert!(pool.release(h1));

    let h2 = pool.alloc();
    assert_eq!(h2.generation(), 1);
    assert_eq!(h2.addr(), h1.addr());
    assert_ne!(h1, h2, "same slot, different incarnation");

    // The stale handle must fail afresh on every access.
    assert!(pool.get(h1).is_none());
    assert_eq!(pool.stats().anamnesis_count, 1);
    assert!(pool.validate(h2));
    assert_eq!(pool.stats().anamnesis_count, 1);
}

#[test]
fn double_release_refused() {
    let pool = small_pool(10);

    let h = pool.alloc();
    assert!(pool.release(h));
    assert!(!pool.release(h), "double release must be refused");
    assert!(pool.stats().anamnesis_count >= 1);
}

#[test]
fn null_and_foreign_handles_refused() {
    let pool = small_pool(10);

    assert!(!pool.release(Handle::NULL));
    assert!(pool.get(Handle::NULL).is_none());
    assert_eq!(pool.stats().anamnesis_count, 2);

    // A handle claiming FREE state never dereferences.
    let h = pool.alloc();
    let forged = Handle::encode(h.generation(), h.addr(), STATE_FREE);
    assert!(pool.get(forged).is_none());

    // An address outside the arena is refused regardless of generation.
    let mut outside = 0u64;
    let foreign = Handle::encode(0, &mut outside as *mut u64 as *mut u8, STATE_LIVE);
    assert!(pool.get(foreign).is_none());
    assert!(!pool.release(foreign));
}

#[test]
fn handle_roundtrip() {
    let pool = small_pool(4);
    let h = pool.alloc();

    let rebuilt = Handle::encode(h.generation(), h.addr(), h.state());
    assert_eq!(rebuilt, h);
    assert_eq!(Handle::from_bits(h.bits()), h);

    assert!(Handle::NULL.is_null());
    assert_eq!(Handle::default(), Handle::NULL);
    assert_eq!(Handle::NULL.generation(), 0);
    assert_eq!(Handle::NULL.state(), 0);
}

#[test]
fn data_integrity() {
    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug)]
    struct TestObj {
        x: u64,
        y: u64,
        tag: [u8; 16],
    }

    let pool = Pool::new(PoolConfig {
        slot_size: std::mem::size_of::<TestObj>(),
        slot_count: 100,
        ..Default::default()
    })
    .expect("pool creation failed");

    let mut handles = Vec::new();
    for i in 0..100u64 {
        let h = pool.alloc();
        assert!(!h.is_null());
        let ptr = pool.get(h).unwrap().as_ptr() as *mut TestObj;
        unsafe {
            ptr.write(TestObj {
                x: i,
                y: i * 2,
                tag: [i as u8; 16],
            });
        }
        handles.push(h);
    }

    for (i, h) in handles.iter().enumerate() {
        let ptr = pool.get(*h).unwrap().as_ptr() as *const TestObj;
        let obj = unsafe { ptr.read() };
        assert_eq!(obj.x, i as u64);
        assert_eq!(obj.y, i as u64 * 2);
        assert_eq!(obj.tag, [i as u8; 16]);
    }
}

#[test]
fn zeroing_policies() {
    let pool = Pool::new(PoolConfig {
        slot_size: 32,
        slot_count: 1,
        zero_on_alloc: true,
        ..Default::default()
    })
    .expect("pool creation failed");

    let h1 = pool.alloc();
    let ptr = pool.get(h1).unwrap().as_ptr();
    unsafe { ptr.write_bytes(0xAB, 32) };
    assert!(pool.release(h1));

    let h2 = pool.alloc();
    let ptr = pool.get(h2).unwrap().as_ptr();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 32) };
    assert!(bytes.iter().all(|&b| b == 0), "zero_on_alloc must clear");

    let pool = Pool::new(PoolConfig {
        slot_size: 32,
        slot_count: 1,
        zero_on_release: true,
        ..Default::default()
    })
    .expect("pool creation failed");

    let h = pool.alloc();
    let ptr = pool.get(h).unwrap().as_ptr();
    unsafe { ptr.write_bytes(0xCD, 32) };
    assert!(pool.release(h));
    // The slot was wiped on the way out; the next incarnation sees zeros.
    let h = pool.alloc();
    let ptr = pool.get(h).unwrap().as_ptr();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 32) };
    assert!(bytes.iter().all(|&b| b == 0), "zero_on_release must clear");
}

#[test]
fn generation_cycling() {
    // Single slot, cycled many times; every superseded handle must fail.
    let pool = Pool::new(PoolConfig {
        slot_size: 64,
        slot_count: 1,
        ..Default::default()
    })
    .expect("pool creation failed");

    let mut old_handles = Vec::new();
    for i in 0..100u16 {
        let h = pool.alloc();
        assert!(!h.is_null());
        assert_eq!(h.generation(), i, "generation should match cycle");
        old_handles.push(h);
        assert!(pool.release(h));
    }

    for h in &old_handles[..99] {
        assert!(!pool.validate(*h), "superseded handle must be exposed");
    }

    let stats = pool.stats();
    assert_eq!(stats.generation_max, 99);
    assert_eq!(stats.slots_free, 1);
    assert_eq!(stats.alloc_count, 100);
    assert_eq!(stats.release_count, 100);
}

#[test]
fn release_balances_free_count() {
    let pool = small_pool(10);
    let before = pool.stats().slots_free;
    for _ in 0..25 {
        let h = pool.alloc();
        assert!(pool.release(h));
    }
    assert_eq!(pool.stats().slots_free, before);
}

#[test]
fn for_each_visits_live_slots() {
    let pool = small_pool(10);

    let a = pool.alloc();
    let b = pool.alloc();
    let c = pool.alloc();
    assert!(pool.release(b));

    let mut seen = Vec::new();
    pool.for_each(|handle, _ptr| {
        seen.push(handle);
        true
    });

    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&a));
    assert!(seen.contains(&c));
    for h in &seen {
        assert!(pool.validate(*h), "for_each must mint valid handles");
    }

    // Early stop.
    let mut visits = 0;
    pool.for_each(|_, _| {
        visits += 1;
        false
    });
    assert_eq!(visits, 1);
}

#[test]
fn concurrent_churn() {
    const NUM_THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 10_000;

    let pool = Arc::new(Pool::new(PoolConfig {
        slot_size: 64,
        slot_count: 1000,
        ..Default::default()
    })
    .expect("pool creation failed"));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let successes = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for thread_id in 0..NUM_THREADS {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        let successes = Arc::clone(&successes);
        workers.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..OPS_PER_THREAD {
                let h = pool.alloc();
                if h.is_null() {
                    continue;
                }
                if let Some(ptr) = pool.get(h) {
                    let cell = ptr.as_ptr() as *const AtomicUsize;
                    unsafe {
                        (*cell).store(thread_id * OPS_PER_THREAD + i, Ordering::Relaxed);
                    }
                    if pool.validate(h) {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                assert!(pool.release(h));
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    assert!(successes.load(Ordering::Relaxed) > NUM_THREADS * OPS_PER_THREAD / 2);
    let stats = pool.stats();
    assert_eq!(stats.slots_free, 1000, "all slots must return to the pool");
    assert_eq!(stats.alloc_count, stats.release_count);
}
