// Binary event tracing for pool operations.
//
// Each thread owns a private ring buffer of 16-byte entries; there is no
// cross-thread synchronization on the hot path. Buffers flush to
// `<dir>/trace_thread_NNN.bin` when 75% full and when the owning thread
// calls `flush_thread` (or on `shutdown`, for the calling thread).
// Entries are appended as raw native-endian structs; the files are meant
// for offline analysis, not human eyes.
//
// Built only with the `trace` cargo feature; without it the pool carries
// no trace code at all.

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Successful allocation.
pub const OP_ALLOC: u8 = 0;
/// Slot released.
pub const OP_RELEASE: u8 = 1;
/// Dereference with a matching generation.
pub const OP_GET_VALID: u8 = 2;
/// Dereference refused for a stale generation.
pub const OP_GET_STALE: u8 = 3;
/// Reserved in the numbering for failed validations.
pub const OP_VALIDATE_FAIL: u8 = 4;

/// One trace record. 16 bytes, written to disk verbatim.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TraceEntry {
    pub timestamp: u64,
    pub slot_index: u32,
    pub generation: u16,
    pub op_type: u8,
    pub thread_id: u8,
}

const _: () = assert!(mem::size_of::<TraceEntry>() == 16);

struct Context {
    output_dir: PathBuf,
    buffer_capacity: u32,
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);
static CONTEXT: Mutex<Option<Context>> = Mutex::new(None);

thread_local! {
    static TLS_BUFFER: RefCell<Option<TraceBuffer>> = const { RefCell::new(None) };
}

/// Monotonic nanoseconds since the first trace event in this process.
fn timestamp() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

struct TraceBuffer {
    entries: Box<[TraceEntry]>,
    capacity: u32,
    head: u32,
    tail: u32,
    thread_id: u8,
    overflow_count: u32,
    entries_written: u64,
    active: bool,
}

impl TraceBuffer {
    fn create() -> Option<TraceBuffer> {
        let capacity = {
            let guard = CONTEXT.lock().ok()?;
            guard.as_ref()?.buffer_capacity
        };
        let entries = vec![
            TraceEntry {
                timestamp: 0,
                slot_index: 0,
                generation: 0,
                op_type: 0,
                thread_id: 0,
            };
            capacity as usize
        ]
        .into_boxed_slice();
        Some(TraceBuffer {
            entries,
            capacity,
            head: 0,
            tail: 0,
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) as u8,
            overflow_count: 0,
            entries_written: 0,
            active: true,
        })
    }

    fn record(&mut self, op_type: u8, slot_index: u32, generation: u16) {
        let mask = self.capacity - 1;
        let idx = (self.head & mask) as usize;
        self.entries[idx] = TraceEntry {
            timestamp: timestamp(),
            slot_index,
            generation,
            op_type,
            thread_id: self.thread_id,
        };
        self.head = self.head.wrapping_add(1);
        self.entries_written += 1;

        // Flush early rather than on the brink, so a burst between checks
        // does not silently lap the reader.
        let used = self.head.wrapping_sub(self.tail) & mask;
        if used > self.capacity / 4 * 3 {
            self.flush();
        }

        if self.head.wrapping_sub(self.tail) >= self.capacity {
            // Ring wrapped: the oldest unflushed entries are gone.
            self.overflow_count += 1;
        }
    }

    fn flush(&mut self) {
        if self.head == self.tail {
            return;
        }
        let path = {
            let Ok(guard) = CONTEXT.lock() else { return };
            let Some(ctx) = guard.as_ref() else { return };
            ctx.output_dir
                .join(format!("trace_thread_{:03}.bin", self.thread_id))
        };

        let mask = self.capacity - 1;
        let mut count = self.head.wrapping_sub(self.tail) & mask;
        if count == 0 && self.overflow_count > 0 {
            // Exactly one full lap pending.
            count = self.capacity;
        }
        if count == 0 {
            return;
        }

        let mut file = match OpenOptions::new().append(true).create(true).open(&path) {
            Ok(f) => f,
            Err(err) => {
                eprintln!("[anamnesis-trace] failed to open {}: {}", path.display(), err);
                return;
            }
        };

        let tail_idx = (self.tail & mask) as usize;
        let head_idx = (self.head & mask) as usize;
        let result = if tail_idx < head_idx {
            file.write_all(entry_bytes(&self.entries[tail_idx..head_idx]))
        } else {
            // Wrapped: tail..end, then start..head.
            file.write_all(entry_bytes(&self.entries[tail_idx..]))
                .and_then(|_| file.write_all(entry_bytes(&self.entries[..head_idx])))
        };
        if let Err(err) = result {
            eprintln!(
                "[anamnesis-trace] incomplete write to {}: {}",
                path.display(),
                err
            );
        }

        self.tail = self.head;
    }
}

fn entry_bytes(entries: &[TraceEntry]) -> &[u8] {
    // SAFETY: TraceEntry is repr(C) plain data with no padding
    // (8 + 4 + 2 + 1 + 1 = 16 bytes).
    unsafe {
        slice::from_raw_parts(
            entries.as_ptr() as *const u8,
            entries.len() * mem::size_of::<TraceEntry>(),
        )
    }
}

/// Starts tracing into `output_dir` with a per-thread ring of
/// `buffer_capacity` entries (must be a power of two).
///
/// Call before spawning the threads whose pool activity should be
/// recorded; buffers are created lazily on each thread's first event.
pub fn init(output_dir: &Path, buffer_capacity: u32) {
    if buffer_capacity == 0 || !buffer_capacity.is_power_of_two() {
        eprintln!(
            "[anamnesis-trace] buffer capacity must be a power of two, got {}",
            buffer_capacity
        );
        return;
    }
    if let Err(err) = fs::create_dir_all(output_dir) {
        // The directory may still be usable; keep going.
        eprintln!(
            "[anamnesis-trace] failed to create {}: {}",
            output_dir.display(),
            err
        );
    }
    if let Ok(mut guard) = CONTEXT.lock() {
        *guard = Some(Context {
            output_dir: output_dir.to_path_buf(),
            buffer_capacity,
        });
    }
    NEXT_THREAD_ID.store(0, Ordering::Relaxed);
    ACTIVE.store(true, Ordering::Release);
    eprintln!(
        "[anamnesis-trace] initialized: dir={}, buffer={} entries",
        output_dir.display(),
        buffer_capacity
    );
}

/// Stops tracing and flushes the calling thread's buffer. Worker threads
/// still holding buffers should call [`flush_thread`] before exiting.
pub fn shutdown() {
    ACTIVE.store(false, Ordering::Release);
    flush_thread();
    eprintln!("[anamnesis-trace] shutdown complete");
}

/// Flushes and retires the calling thread's buffer.
pub fn flush_thread() {
    TLS_BUFFER.with(|cell| {
        if let Some(mut buffer) = cell.borrow_mut().take() {
            if buffer.active {
                buffer.flush();
            }
        }
    });
}

/// Entries written and overflow count for the calling thread, or `None`
/// if this thread has recorded nothing yet.
pub fn thread_stats() -> Option<(u64, u32)> {
    TLS_BUFFER.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|buf| (buf.entries_written, buf.overflow_count))
    })
}

fn record(op_type: u8, slot_index: u32, generation: u16) {
    TLS_BUFFER.with(|cell| {
        let Ok(mut slot) = cell.try_borrow_mut() else {
            return;
        };
        if slot.is_none() {
            if !ACTIVE.load(Ordering::Acquire) {
                return;
            }
            *slot = TraceBuffer::create();
        }
        if let Some(buffer) = slot.as_mut() {
            if buffer.active {
                buffer.record(op_type, slot_index, generation);
            }
        }
    });
}

pub(crate) fn alloc_event(slot_index: u32, generation: u16) {
    record(OP_ALLOC, slot_index, generation);
}

pub(crate) fn release_event(slot_index: u32, generation: u16) {
    record(OP_RELEASE, slot_index, generation);
}

pub(crate) fn get_event(slot_index: u32, generation: u16, valid: bool) {
    record(
        if valid { OP_GET_VALID } else { OP_GET_STALE },
        slot_index,
        generation,
    );
}
