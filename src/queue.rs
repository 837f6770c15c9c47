// Lock-free MPMC FIFO (Michael-Scott) whose node identity is a handle.
//
// Every atomic field that classically holds a node pointer (head, tail,
// per-node next) holds a handle word instead. A CAS therefore compares
// (generation, address, state) bit-identically: when a node's slot is
// released and reused between a snapshot and the CAS, the generation
// differs, the CAS fails, and the operation retries. That failed
// dereference is counted as an ABA-prevention event. No hazard pointers
// or epoch machinery are needed; the generation is the tag.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::handle::Handle;
use crate::pool::{align_up, Pool, PoolConfig, PoolError};

/// Queue node: the successor link, followed by the item bytes within the
/// same pool slot.
#[repr(C)]
struct Node {
    next: AtomicU64,
}

/// Field-by-field snapshot of the queue counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub capacity: usize,
    pub push_count: usize,
    pub pop_count: usize,
    /// Pushes refused because the node pool was exhausted.
    pub push_fails: usize,
    /// Pops that found the queue empty.
    pub pop_fails: usize,
    /// CAS retries forced by a handle whose slot had been reused.
    pub aba_prevented: usize,
}

/// Lock-free multi-producer/multi-consumer FIFO.
///
/// Nodes live in a private pool sized to `capacity + 1`; one slot is
/// permanently occupied by the dummy sentinel the head points at. Items
/// are stored by value and moved out as raw byte copies, hence the
/// `T: Copy` bound: a pop may read a payload it then discards when its
/// head CAS loses, and discarding must not drop anything.
///
/// No operation blocks or panics. Failures surface as `None`/`false`
/// plus a monotonic counter.
pub struct Queue<T: Copy + Send> {
    pool: Pool,
    capacity: usize,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    length: AtomicUsize,
    push_count: AtomicUsize,
    pop_count: AtomicUsize,
    push_fails: AtomicUsize,
    pop_fails: AtomicUsize,
    aba_prevented: AtomicUsize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for Queue<T> {}
unsafe impl<T: Copy + Send> Sync for Queue<T> {}

impl<T: Copy + Send> Queue<T> {
    /// Offset of the item bytes within a node slot.
    const DATA_OFFSET: usize = align_up(mem::size_of::<Node>(), mem::align_of::<T>());

    /// Creates a queue holding up to `capacity` items of `T`.
    ///
    /// Zero-sized `T` and zero capacity are construction faults.
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if mem::size_of::<T>() == 0 {
            return Err(PoolError::ZeroSlotSize);
        }
        if capacity == 0 {
            return Err(PoolError::ZeroSlotCount);
        }

        let pool = Pool::new(PoolConfig {
            slot_size: Self::DATA_OFFSET + mem::size_of::<T>(),
            slot_count: capacity + 1,
            alignment: mem::align_of::<T>().max(8),
            zero_on_alloc: false,
            zero_on_release: false,
        })?;

        let queue = Self {
            pool,
            capacity,
            head: CachePadded::new(AtomicU64::new(Handle::NULL.bits())),
            tail: CachePadded::new(AtomicU64::new(Handle::NULL.bits())),
            length: AtomicUsize::new(0),
            push_count: AtomicUsize::new(0),
            pop_count: AtomicUsize::new(0),
            push_fails: AtomicUsize::new(0),
            pop_fails: AtomicUsize::new(0),
            aba_prevented: AtomicUsize::new(0),
            _marker: PhantomData,
        };

        let dummy = queue.alloc_node(None);
        if dummy.is_null() {
            return Err(PoolError::AllocationFailed);
        }
        queue.head.store(dummy.bits(), Ordering::Relaxed);
        queue.tail.store(dummy.bits(), Ordering::Relaxed);

        Ok(queue)
    }

    /// Enqueues `item`.
    ///
    /// Returns a receipt handle naming the node that now carries the
    /// item, or `None` when the queue is full (`push_fails` increments).
    /// The receipt is informational; `pop` does not need it.
    pub fn push(&self, item: T) -> Option<Handle> {
        let new_h = self.alloc_node(Some(&item));
        if new_h.is_null() {
            self.push_fails.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut tail_bits;
        loop {
            tail_bits = self.tail.load(Ordering::Acquire);
            let Some(tail) = self.node(Handle::from_bits(tail_bits)) else {
                // Tail's slot was reused under us; the generation check
                // caught it.
                self.aba_prevented.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let next_bits = tail.next.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) != tail_bits {
                self.aba_prevented.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if Handle::from_bits(next_bits).is_null() {
                if tail
                    .next
                    .compare_exchange_weak(
                        next_bits,
                        new_h.bits(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            } else {
                // Tail is lagging; help it forward and retry.
                let _ = self.tail.compare_exchange(
                    tail_bits,
                    next_bits,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }

        // Swing tail over the node we just linked. Losing this CAS means
        // someone else already helped.
        let _ = self.tail.compare_exchange(
            tail_bits,
            new_h.bits(),
            Ordering::Release,
            Ordering::Relaxed,
        );

        self.length.fetch_add(1, Ordering::Relaxed);
        self.push_count.fetch_add(1, Ordering::Relaxed);
        Some(new_h)
    }

    /// Dequeues the oldest item, or `None` when the queue is empty
    /// (`pop_fails` increments).
    pub fn pop(&self) -> Option<T> {
        loop {
            let head_bits = self.head.load(Ordering::Acquire);
            let tail_bits = self.tail.load(Ordering::Acquire);
            let Some(head) = self.node(Handle::from_bits(head_bits)) else {
                self.aba_prevented.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let next_bits = head.next.load(Ordering::Acquire);
            if self.head.load(Ordering::Acquire) != head_bits {
                self.aba_prevented.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if head_bits == tail_bits {
                if Handle::from_bits(next_bits).is_null() {
                    self.pop_fails.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                // Tail is lagging behind a completed link.
                let _ = self.tail.compare_exchange(
                    tail_bits,
                    next_bits,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else {
                let next_h = Handle::from_bits(next_bits);
                let Some(next_ptr) = self.pool.get(next_h) else {
                    self.aba_prevented.fetch_add(1, Ordering::Relaxed);
                    continue;
                };

                // Copy the payload into a local before the CAS; only the
                // success branch ever looks at it. On a lost race the
                // bytes may belong to a reused slot and are discarded.
                let mut item = MaybeUninit::<T>::uninit();
                // SAFETY: next_ptr is a node slot; the item bytes start
                // at DATA_OFFSET and T: Copy makes a discarded read inert.
                unsafe {
                    ptr::copy_nonoverlapping(
                        Self::data_ptr(next_ptr.as_ptr()),
                        item.as_mut_ptr(),
                        1,
                    );
                }

                if self
                    .head
                    .compare_exchange(
                        head_bits,
                        next_bits,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // The consumed node becomes the new dummy; the old
                    // dummy goes back to the pool.
                    self.pool.release(Handle::from_bits(head_bits));
                    self.length.fetch_sub(1, Ordering::Relaxed);
                    self.pop_count.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: the head CAS succeeded, so the copy above
                    // happened before the node could be released.
                    return Some(unsafe { item.assume_init() });
                }
            }
        }
    }

    /// Copies the oldest item without removing it.
    ///
    /// Concurrent with a pop this may return a value that is about to be
    /// consumed, but never one that was never enqueued.
    pub fn peek(&self) -> Option<T> {
        let head = self.node(Handle::from_bits(self.head.load(Ordering::Acquire)))?;
        let next_h = Handle::from_bits(head.next.load(Ordering::Acquire));
        if next_h.is_null() {
            return None;
        }
        let next_ptr = self.pool.get(next_h)?;
        // SAFETY: next_ptr is a node slot with item bytes at DATA_OFFSET.
        Some(unsafe { ptr::read(Self::data_ptr(next_ptr.as_ptr())) })
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        match self.node(Handle::from_bits(self.head.load(Ordering::Acquire))) {
            Some(head) => Handle::from_bits(head.next.load(Ordering::Acquire)).is_null(),
            None => true,
        }
    }

    /// Cached item count: exact when quiescent, an estimate under
    /// concurrency.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    /// Maximum number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the queue counters; fields may be mutually skewed
    /// under concurrency.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            push_fails: self.push_fails.load(Ordering::Relaxed),
            pop_fails: self.pop_fails.load(Ordering::Relaxed),
            aba_prevented: self.aba_prevented.load(Ordering::Relaxed),
        }
    }

    /// Counters of the private node pool. Anamnesis events here are the
    /// generation checks that failed on behalf of the queue protocol.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    fn alloc_node(&self, item: Option<&T>) -> Handle {
        let h = self.pool.alloc();
        if h.is_null() {
            return Handle::NULL;
        }
        let Some(ptr) = self.pool.get(h) else {
            // Freshly minted handles always dereference.
            return Handle::NULL;
        };
        // SAFETY: the slot is exclusively ours until the node is linked.
        unsafe {
            let node = ptr.as_ptr() as *mut Node;
            (*node).next.store(Handle::NULL.bits(), Ordering::Relaxed);
            if let Some(value) = item {
                ptr::write(Self::data_ptr(ptr.as_ptr()), *value);
            }
        }
        h
    }

    /// Dereferences a node handle through the pool; `None` means the
    /// handle went stale.
    #[inline]
    fn node(&self, h: Handle) -> Option<&Node> {
        self.pool
            .get(h)
            // SAFETY: node slots always begin with a Node header.
            .map(|p| unsafe { &*(p.as_ptr() as *const Node) })
    }

    #[inline]
    fn data_ptr(node: *mut u8) -> *mut T {
        // SAFETY: slots are DATA_OFFSET + size_of::<T>() bytes, aligned
        // to align_of::<T>().max(8), so the offset stays in bounds.
        unsafe { node.add(Self::DATA_OFFSET) as *mut T }
    }
}

impl<T: Copy + Send> Drop for Queue<T> {
    fn drop(&mut self) {
        // Drain pending items, then retire the terminal dummy; the pool
        // frees the arena afterwards.
        if Handle::from_bits(self.head.load(Ordering::Relaxed)).is_null() {
            return;
        }
        while self.pop().is_some() {}
        let head = Handle::from_bits(self.head.load(Ordering::Relaxed));
        self.pool.release(head);
    }
}

impl<T: Copy + Send> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
