// Fixed-size slot pool with generation-checked handles.
//
// The arena is one contiguous allocation of `slot_count` slots of equal
// stride. Each slot carries a small header (true generation + free-list
// link) immediately before its payload bytes. Free slots form a Treiber
// stack threaded through the headers; the stack head and the links hold
// handle words, never raw pointers, so a stale handle popped concurrently
// with a reuse fails its generation check instead of aliasing the slot.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::handle::{Handle, STATE_FREE, STATE_LIVE};

#[cfg(feature = "trace")]
use crate::trace;

pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Per-slot header, stored immediately before the payload bytes.
///
/// `generation` is the slot's true generation; a handle dereferences only
/// while its claimed generation matches. `next` is the free-list link and
/// is meaningful only while the slot is free.
#[repr(C)]
struct SlotHeader {
    next: AtomicU64,
    generation: AtomicU16,
}

/// Pool construction parameters. Immutable once the pool exists.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Payload bytes per slot. Must be nonzero.
    pub slot_size: usize,
    /// Number of slots. Fixed for the pool's lifetime. Must be nonzero.
    pub slot_count: usize,
    /// Payload alignment. Power of two, at least 8 (the handle steals the
    /// low 3 address bits). 0 selects the default of 8.
    pub alignment: usize,
    /// Clear payload bytes on every allocation.
    pub zero_on_alloc: bool,
    /// Clear payload bytes on every release.
    pub zero_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_size: 64,
            slot_count: 1024,
            alignment: 8,
            zero_on_alloc: false,
            zero_on_release: false,
        }
    }
}

/// Why pool construction was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    ZeroSlotSize,
    ZeroSlotCount,
    /// Alignment was not a power of two, or below 8.
    BadAlignment(usize),
    AllocationFailed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ZeroSlotSize => write!(f, "slot_size must be nonzero"),
            PoolError::ZeroSlotCount => write!(f, "slot_count must be nonzero"),
            PoolError::BadAlignment(a) => {
                write!(f, "alignment {} is not a power of two >= 8", a)
            }
            PoolError::AllocationFailed => write!(f, "arena allocation failed"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Field-by-field snapshot of the pool counters.
///
/// Counters are monotonic but the fields are read one at a time, so a
/// snapshot taken under concurrency may be skewed by in-flight operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub slot_count: usize,
    pub slots_free: usize,
    pub slots_live: usize,
    pub alloc_count: usize,
    pub release_count: usize,
    /// Handles rejected for a null/foreign/stale claim.
    pub anamnesis_count: usize,
    pub generation_max: u16,
}

/// Fixed arena of uniformly sized slots addressed by generation-checked
/// handles.
///
/// Every access re-evaluates the handle against the slot's current
/// generation; there is no cached validity. A rejected handle is counted
/// as an anamnesis event and reported through the return value, never a
/// panic.
pub struct Pool {
    slot_size: usize,
    stride: usize,
    slot_count: usize,
    zero_on_alloc: bool,
    zero_on_release: bool,

    memory: *mut u8,
    layout: Layout,
    slots_base: *mut u8,

    free_head: CachePadded<AtomicU64>,

    slots_free: AtomicUsize,
    alloc_count: AtomicUsize,
    release_count: AtomicUsize,
    anamnesis_count: AtomicUsize,
    generation_max: AtomicU16,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Builds a pool from `config`.
    ///
    /// Every slot starts at generation 0 on the free list; the list is
    /// seeded in reverse so the first allocation hands out slot 0.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.slot_size == 0 {
            return Err(PoolError::ZeroSlotSize);
        }
        if config.slot_count == 0 {
            return Err(PoolError::ZeroSlotCount);
        }
        let alignment = if config.alignment == 0 {
            8
        } else {
            config.alignment
        };
        if !alignment.is_power_of_two() || alignment < 8 {
            return Err(PoolError::BadAlignment(alignment));
        }

        let header_size = align_up(mem::size_of::<SlotHeader>(), alignment);
        let payload_size = align_up(config.slot_size, alignment);
        let stride = align_up(header_size + payload_size, 8);

        let total = stride
            .checked_mul(config.slot_count)
            .and_then(|n| n.checked_add(alignment))
            .map(|n| align_up(n, alignment))
            .ok_or(PoolError::AllocationFailed)?;
        let layout =
            Layout::from_size_align(total, alignment).map_err(|_| PoolError::AllocationFailed)?;

        // SAFETY: layout has nonzero size (slot_size and slot_count are
        // nonzero).
        let memory = unsafe { alloc(layout) };
        if memory.is_null() {
            return Err(PoolError::AllocationFailed);
        }

        // The first payload sits one header past the start, aligned up, so
        // that every slot's header lands inside the arena.
        let slots_base =
            align_up(memory as usize + mem::size_of::<SlotHeader>(), alignment) as *mut u8;

        let pool = Self {
            slot_size: config.slot_size,
            stride,
            slot_count: config.slot_count,
            zero_on_alloc: config.zero_on_alloc,
            zero_on_release: config.zero_on_release,
            memory,
            layout,
            slots_base,
            free_head: CachePadded::new(AtomicU64::new(Handle::NULL.bits())),
            slots_free: AtomicUsize::new(config.slot_count),
            alloc_count: AtomicUsize::new(0),
            release_count: AtomicUsize::new(0),
            anamnesis_count: AtomicUsize::new(0),
            generation_max: AtomicU16::new(0),
        };

        // Seed the free list. Construction is single-threaded, so the
        // headers are written directly and the head is stored last.
        let mut head = Handle::NULL;
        for index in (0..config.slot_count).rev() {
            // SAFETY: index < slot_count, so payload and header are in
            // bounds; the header memory is uninitialized and exclusively
            // ours, so a plain write is sound.
            unsafe {
                let payload = pool.slot_ptr(index);
                let header = payload.sub(mem::size_of::<SlotHeader>()) as *mut SlotHeader;
                ptr::write(
                    header,
                    SlotHeader {
                        next: AtomicU64::new(head.bits()),
                        generation: AtomicU16::new(0),
                    },
                );
                head = Handle::encode(0, payload, STATE_FREE);
            }
        }
        pool.free_head.store(head.bits(), Ordering::Relaxed);

        Ok(pool)
    }

    /// Pops a free slot and mints a LIVE handle carrying the slot's
    /// current generation. Returns the null handle when the pool is
    /// exhausted; exhaustion mutates no counters.
    pub fn alloc(&self) -> Handle {
        let mut old_head = self.free_head.load(Ordering::Acquire);
        let payload = loop {
            let head = Handle::from_bits(old_head);
            if head.is_null() {
                return Handle::NULL;
            }
            let payload = head.addr();
            // SAFETY: the free list only ever holds handles the pool
            // minted, so the address is a valid slot payload.
            let new_head = unsafe { Self::header(payload).next.load(Ordering::Relaxed) };
            match self.free_head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break payload,
                Err(actual) => old_head = actual,
            }
        };

        // SAFETY: payload came off the free list, see above.
        let header = unsafe { Self::header(payload) };
        let generation = header.generation.load(Ordering::Acquire);

        // Raise the published maximum. A lost update here only skews a
        // statistic, so the retry loop tolerates racing writers.
        let mut max = self.generation_max.load(Ordering::Relaxed);
        while generation > max {
            match self.generation_max.compare_exchange_weak(
                max,
                generation,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }

        header.next.store(Handle::NULL.bits(), Ordering::Relaxed);
        self.slots_free.fetch_sub(1, Ordering::Relaxed);
        self.alloc_count.fetch_add(1, Ordering::Relaxed);

        if self.zero_on_alloc {
            // SAFETY: payload points at slot_size writable bytes.
            unsafe { ptr::write_bytes(payload, 0, self.slot_size) };
        }

        #[cfg(feature = "trace")]
        trace::alloc_event(self.slot_index(payload) as u32, generation);

        Handle::encode(generation, payload, STATE_LIVE)
    }

    /// Returns the slot named by `handle` to the free list.
    ///
    /// The slot's generation is bumped first, so every outstanding copy of
    /// `handle` is counterfeit from this call onward. Rejects (and counts
    /// an anamnesis event for) a null, foreign, non-LIVE, or stale handle.
    pub fn release(&self, handle: Handle) -> bool {
        if handle.is_null() || handle.state() != STATE_LIVE {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let payload = handle.addr();
        if !self.in_pool(payload) {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // SAFETY: in_pool confirmed the address is a slot payload.
        let header = unsafe { Self::header(payload) };
        let claimed = handle.generation();
        let true_gen = header.generation.load(Ordering::Acquire);
        if claimed != true_gen {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // The slot is reborn: all handles minted for the old generation
        // stop validating here.
        let new_gen = true_gen.wrapping_add(1);
        header.generation.store(new_gen, Ordering::Release);

        if self.zero_on_release {
            // SAFETY: payload points at slot_size writable bytes.
            unsafe { ptr::write_bytes(payload, 0, self.slot_size) };
        }

        let free_handle = Handle::encode(new_gen, payload, STATE_FREE);
        let mut old_head = self.free_head.load(Ordering::Acquire);
        loop {
            header.next.store(old_head, Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                old_head,
                free_handle.bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old_head = actual,
            }
        }

        self.slots_free.fetch_add(1, Ordering::Relaxed);
        self.release_count.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "trace")]
        trace::release_event(self.slot_index(payload) as u32, claimed);

        true
    }

    /// Dereferences `handle`.
    ///
    /// Succeeds only while the handle's claimed generation matches the
    /// slot's true generation at this instant. Any rejection counts an
    /// anamnesis event and returns `None`.
    pub fn get(&self, handle: Handle) -> Option<NonNull<u8>> {
        if handle.is_null() || handle.state() != STATE_LIVE {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let payload = handle.addr();
        if !self.in_pool(payload) {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: in_pool confirmed the address is a slot payload.
        let header = unsafe { Self::header(payload) };
        let claimed = handle.generation();
        let true_gen = header.generation.load(Ordering::Acquire);
        if claimed != true_gen {
            self.anamnesis_count.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "trace")]
            trace::get_event(self.slot_index(payload) as u32, claimed, false);
            return None;
        }

        #[cfg(feature = "trace")]
        trace::get_event(self.slot_index(payload) as u32, claimed, true);

        NonNull::new(payload)
    }

    /// Whether `handle` would dereference right now.
    pub fn validate(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Snapshot of the counters. Fields are loaded one at a time and may
    /// be mutually skewed under concurrency.
    pub fn stats(&self) -> PoolStats {
        let slots_free = self.slots_free.load(Ordering::Relaxed);
        PoolStats {
            slot_count: self.slot_count,
            slots_free,
            slots_live: self.slot_count - slots_free,
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            release_count: self.release_count.load(Ordering::Relaxed),
            anamnesis_count: self.anamnesis_count.load(Ordering::Relaxed),
            generation_max: self.generation_max.load(Ordering::Relaxed),
        }
    }

    /// Visits every slot not currently on the free list, passing a
    /// freshly minted handle with the slot's current generation. The
    /// visitor returns `false` to stop.
    ///
    /// Debugging aid only: not thread-safe. The free list is snapshotted
    /// without synchronization, and a concurrent alloc or release makes
    /// the snapshot (and thus the visit set) meaningless. A repeated or
    /// foreign link is treated as corruption and ends the snapshot.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(Handle, NonNull<u8>) -> bool,
    {
        let mut is_free = vec![false; self.slot_count];

        let mut h = Handle::from_bits(self.free_head.load(Ordering::Acquire));
        while !h.is_null() {
            let payload = h.addr();
            if !self.in_pool(payload) {
                break;
            }
            let index = self.slot_index(payload);
            if index >= self.slot_count || is_free[index] {
                break;
            }
            is_free[index] = true;
            // SAFETY: in_pool confirmed the address is a slot payload.
            h = Handle::from_bits(unsafe { Self::header(payload).next.load(Ordering::Acquire) });
        }

        for index in 0..self.slot_count {
            if is_free[index] {
                continue;
            }
            // SAFETY: index < slot_count.
            let payload = unsafe { self.slot_ptr(index) };
            let generation = unsafe { Self::header(payload).generation.load(Ordering::Acquire) };
            let handle = Handle::encode(generation, payload, STATE_LIVE);
            let Some(ptr) = NonNull::new(payload) else {
                break;
            };
            if !visitor(handle, ptr) {
                break;
            }
        }
    }

    /// Payload bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total slots in the arena.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[inline]
    unsafe fn slot_ptr(&self, index: usize) -> *mut u8 {
        self.slots_base.add(index * self.stride)
    }

    #[inline]
    fn slot_index(&self, payload: *mut u8) -> usize {
        (payload as usize - self.slots_base as usize) / self.stride
    }

    /// Header of the slot whose payload starts at `payload`.
    ///
    /// # Safety
    /// `payload` must be a slot payload address inside this pool.
    #[inline]
    unsafe fn header<'a>(payload: *mut u8) -> &'a SlotHeader {
        &*(payload.sub(mem::size_of::<SlotHeader>()) as *const SlotHeader)
    }

    #[inline]
    fn in_pool(&self, payload: *mut u8) -> bool {
        let p = payload as usize;
        let base = self.slots_base as usize;
        let end = base + self.slot_count * self.stride;
        if p < base || p >= end {
            return false;
        }

        #[cfg(feature = "strict-validation")]
        {
            // Forged mid-slot addresses carry a valid range but a nonzero
            // offset within their slot.
            let offset = p - base;
            let on_boundary = if self.stride.is_power_of_two() {
                offset & (self.stride - 1) == 0
            } else {
                offset % self.stride == 0
            };
            if !on_boundary {
                return false;
            }
        }

        true
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Slot headers are plain atomics and payloads are raw bytes;
        // nothing needs dropping beyond the arena itself.
        unsafe { dealloc(self.memory, self.layout) };
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count)
            .field("stride", &self.stride)
            .field("stats", &self.stats())
            .finish()
    }
}
