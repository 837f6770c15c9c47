// 64-bit handle codec.
//
// A handle packs three fields into one word:
//   [63..48] generation (16 bits)
//   [47..3]  address, low 3 bits stripped (45 bits)
//   [2..0]   state tag (3 bits)
//
// The all-zero word is the null handle. Because slot payloads are aligned
// to at least 8 bytes, the low 3 address bits are always free for the
// state tag, and user-space addresses fit in 48 bits on the supported
// 64-bit targets.

use std::fmt;

/// Slot is on the free list.
pub const STATE_FREE: u8 = 0x0;
/// Slot is allocated and may be dereferenced.
pub const STATE_LIVE: u8 = 0x1;
/// Reserved: slot pending reclamation.
pub const STATE_QUARANTINE: u8 = 0x2;
/// Reserved: CAS lock bit.
pub const STATE_LOCKED: u8 = 0x4;

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFF8;
const STATE_MASK: u64 = 0x7;
const GEN_SHIFT: u32 = 48;

/// Opaque 64-bit token naming one incarnation of one pool slot.
///
/// Handles are plain data: copying one never confers ownership, and a
/// handle that outlives its slot's incarnation simply stops validating.
/// Equality is bit equality, so two handles to the same address with
/// different generations are distinct values.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// The distinguished null handle.
    pub const NULL: Handle = Handle(0);

    /// Packs `(generation, address, state)` into a handle.
    ///
    /// Pure bit packing: the address is masked, not checked against any
    /// pool. Low 3 address bits are discarded.
    #[inline]
    pub fn encode(generation: u16, addr: *mut u8, state: u8) -> Self {
        Handle(
            ((generation as u64) << GEN_SHIFT)
                | (addr as usize as u64 & ADDR_MASK)
                | (state as u64 & STATE_MASK),
        )
    }

    /// The generation this handle claims.
    #[inline]
    pub fn generation(self) -> u16 {
        (self.0 >> GEN_SHIFT) as u16
    }

    /// The slot address this handle refers to.
    #[inline]
    pub fn addr(self) -> *mut u8 {
        (self.0 & ADDR_MASK) as usize as *mut u8
    }

    /// The 3-bit lifecycle tag.
    #[inline]
    pub fn state(self) -> u8 {
        (self.0 & STATE_MASK) as u8
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw word, for storage in an atomic cell.
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Reconstructs a handle from a raw word previously obtained via
    /// [`Handle::bits`].
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Handle(bits)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NULL
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("generation", &self.generation())
            .field("addr", &self.addr())
            .field("state", &self.state())
            .finish()
    }
}
