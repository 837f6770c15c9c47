//! anamnesis - handle-based concurrent memory primitives
//!
//! Raw pointers crossing thread boundaries in lock-free structures can be
//! forged by slot reuse: the address matches, the object does not. This
//! crate replaces them with 64-bit handles that pack a per-slot
//! generation counter next to the address. The pool remembers each
//! slot's true generation; a handle that outlives its slot's incarnation
//! is exposed on use instead of corrupting memory.
//!
//! - [`Pool`]: fixed-size slot arena with a lock-free free list and
//!   generation-checked access.
//! - [`Queue`]: Michael-Scott MPMC FIFO whose CAS protocol compares
//!   handles, which structurally rules out the ABA hazard.

pub mod handle;
pub mod pool;
pub mod queue;
#[cfg(feature = "trace")]
pub mod trace;

pub use handle::{Handle, STATE_FREE, STATE_LIVE, STATE_LOCKED, STATE_QUARANTINE};
pub use pool::{Pool, PoolConfig, PoolError, PoolStats};
pub use queue::{Queue, QueueStats};

// Common interface for MPMC queues, so tests and benches can drive a
// queue generically.
pub trait MpmcQueue<T: Send>: Send + Sync + 'static {
    // Error on push, carrying the item back when the queue refuses it.
    type PushError;
    // Error on pop when the queue is empty.
    type PopError;

    // Attempts to enqueue an item. Called by any producer.
    fn push(&self, item: T) -> Result<(), Self::PushError>;

    // Attempts to dequeue the oldest item. Called by any consumer.
    fn pop(&self) -> Result<T, Self::PopError>;

    // True when the queue currently holds no items.
    fn is_empty(&self) -> bool;

    /// True when a subsequent `push` is expected to fail. Best-effort
    /// under concurrency.
    fn is_full(&self) -> bool;
}

impl<T: Copy + Send + 'static> MpmcQueue<T> for Queue<T> {
    type PushError = T;
    type PopError = ();

    fn push(&self, item: T) -> Result<(), T> {
        match Queue::push(self, item) {
            Some(_) => Ok(()),
            None => Err(item),
        }
    }

    fn pop(&self) -> Result<T, ()> {
        Queue::pop(self).ok_or(())
    }

    fn is_empty(&self) -> bool {
        Queue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        self.pool_stats().slots_free == 0
    }
}
