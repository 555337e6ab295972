//! Heap Block Metadata
//!
//! Every block of the heap, hole or allocation, is framed by a header at its
//! lowest address and a footer at its highest:
//!
//! ```text
//! +-------------+---------------------------+-------------+
//! | BlockHeader |          payload          | BlockFooter |
//! +-------------+---------------------------+-------------+
//! ^ block                                                 ^ block + size
//! ```
//!
//! `size` covers all three parts. The footer points back at its header, so a
//! neighbour can be reached in O(1) from either side.
//!
//! # Security Properties
//! - Both ends carry [`HEAP_MAGIC`]; a mismatch means corruption or misuse
//! - The hole flag is stored as a byte and compared against a known value,
//!   never reinterpreted from arbitrary memory as `bool`

use core::mem::{align_of, size_of};

/// Sentinel written into every header and footer.
pub const HEAP_MAGIC: u32 = 0x1238_90AB;

/// Size of a block header in bytes.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Size of a block footer in bytes.
pub const FOOTER_SIZE: usize = size_of::<BlockFooter>();
/// Metadata bytes per block; also the smallest possible block.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
/// Granularity of block addresses and sizes.
pub const BLOCK_ALIGN: usize = align_of::<usize>();

const _: () = assert!(HEADER_SIZE % BLOCK_ALIGN == 0 && FOOTER_SIZE % BLOCK_ALIGN == 0);

/// Hole flag value for a free block.
const HOLE: u8 = 1;
/// Hole flag value for an allocation.
const USED: u8 = 0;

/// Header at the start of every block.
#[repr(C)]
pub struct BlockHeader {
    /// Always [`HEAP_MAGIC`].
    pub magic: u32,
    /// [`HOLE`] or [`USED`].
    is_hole: u8,
    /// Total block size (header + payload + footer).
    pub size: usize,
}

/// Footer at the end of every block.
#[repr(C)]
pub struct BlockFooter {
    /// Always [`HEAP_MAGIC`].
    pub magic: u32,
    /// The header of the same block.
    pub header: *mut BlockHeader,
}

/// Round a request up to the block granularity.
#[inline]
pub const fn block_align_up(size: usize) -> usize {
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Address of a block header in heap memory.
///
/// All accessors are unsafe: the caller asserts that a header (or, for the
/// checks, at least readable memory) lives at the address.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockPtr(*mut BlockHeader);

impl BlockPtr {
    /// Block at `addr`.
    #[inline]
    pub const fn at(addr: usize) -> Self {
        Self(addr as *mut BlockHeader)
    }

    /// Block whose footer is at `footer`, read through the back-pointer.
    ///
    /// # Safety
    /// `footer` must be readable.
    #[inline]
    pub unsafe fn from_footer(footer: *const BlockFooter) -> Self {
        // SAFETY: forwarded to the caller.
        Self(unsafe { (*footer).header })
    }

    /// Block owning the payload at `payload`.
    #[inline]
    pub fn from_payload(payload: *mut u8) -> Self {
        Self::at(payload as usize - HEADER_SIZE)
    }

    /// Start address of the block.
    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Raw header pointer.
    #[inline]
    pub const fn as_ptr(self) -> *mut BlockHeader {
        self.0
    }

    /// First payload byte.
    #[inline]
    pub fn payload(self) -> *mut u8 {
        (self.addr() + HEADER_SIZE) as *mut u8
    }

    /// Write a header and matching footer for a block of `size` bytes.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be writable heap memory owned by the caller
    /// and `size >= OVERHEAD`.
    pub unsafe fn write(self, size: usize, hole: bool) {
        debug_assert!(size >= OVERHEAD && size % BLOCK_ALIGN == 0);
        // SAFETY: forwarded to the caller.
        unsafe {
            self.0.write(BlockHeader {
                magic: HEAP_MAGIC,
                is_hole: if hole { HOLE } else { USED },
                size,
            });
            self.write_footer();
        }
    }

    /// Rewrite the footer from the size currently in the header.
    ///
    /// # Safety
    /// The header must be valid and the whole block writable.
    pub unsafe fn write_footer(self) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.footer().write(BlockFooter {
                magic: HEAP_MAGIC,
                header: self.0,
            });
        }
    }

    /// Footer location implied by the header's size.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn footer(self) -> *mut BlockFooter {
        // SAFETY: forwarded to the caller.
        (self.addr() + unsafe { self.size() } - FOOTER_SIZE) as *mut BlockFooter
    }

    /// First address past the block.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn end(self) -> usize {
        // SAFETY: forwarded to the caller.
        self.addr() + unsafe { self.size() }
    }

    /// Total size recorded in the header.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn size(self) -> usize {
        // SAFETY: forwarded to the caller.
        unsafe { (*self.0).size }
    }

    /// Overwrite the recorded size. The footer is left untouched.
    ///
    /// # Safety
    /// The header must be writable.
    #[inline]
    pub unsafe fn set_size(self, size: usize) {
        // SAFETY: forwarded to the caller.
        unsafe { (*self.0).size = size }
    }

    /// Whether the block is free.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn is_hole(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { (*self.0).is_hole == HOLE }
    }

    /// Flag the block as free or allocated.
    ///
    /// # Safety
    /// The header must be writable.
    #[inline]
    pub unsafe fn set_hole(self, hole: bool) {
        // SAFETY: forwarded to the caller.
        unsafe { (*self.0).is_hole = if hole { HOLE } else { USED } }
    }

    /// Whether the header carries the sentinel.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn has_magic(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { (*self.0).magic == HEAP_MAGIC }
    }

    /// Whether the footer carries the sentinel and points back at this header.
    ///
    /// # Safety
    /// The header and the footer it implies must be readable.
    #[inline]
    pub unsafe fn footer_matches(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe {
            let footer = self.footer();
            (*footer).magic == HEAP_MAGIC && (*footer).header == self.0
        }
    }
}

impl core::fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Arena([u8; 256]);

    #[test]
    fn test_write_frames_block() {
        let mut arena = Arena([0; 256]);
        let base = arena.0.as_mut_ptr() as usize;
        let block = BlockPtr::at(base + 32);

        // SAFETY: the block lies inside the arena.
        unsafe {
            block.write(128, true);
            assert!(block.has_magic());
            assert!(block.is_hole());
            assert_eq!(block.size(), 128);
            assert_eq!(block.end(), base + 160);
            assert_eq!(block.footer() as usize, base + 160 - FOOTER_SIZE);
            assert!(block.footer_matches());
            assert_eq!(BlockPtr::from_footer(block.footer()), block);
        }
    }

    #[test]
    fn test_payload_roundtrip() {
        let mut arena = Arena([0; 256]);
        let block = BlockPtr::at(arena.0.as_mut_ptr() as usize);
        assert_eq!(block.payload() as usize, block.addr() + HEADER_SIZE);
        assert_eq!(BlockPtr::from_payload(block.payload()), block);
    }

    #[test]
    fn test_stale_footer_detected() {
        let mut arena = Arena([0; 256]);
        let block = BlockPtr::at(arena.0.as_mut_ptr() as usize);
        // SAFETY: the block lies inside the arena.
        unsafe {
            block.write(64, false);
            block.set_size(96);
            assert!(!block.footer_matches());
            block.write_footer();
            assert!(block.footer_matches());
            assert!(!block.is_hole());
        }
    }

    #[test]
    fn test_block_align_up() {
        assert_eq!(block_align_up(0), 0);
        assert_eq!(block_align_up(1), BLOCK_ALIGN);
        assert_eq!(block_align_up(BLOCK_ALIGN), BLOCK_ALIGN);
    }
}
