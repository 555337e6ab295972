//! Physical Frame Allocator
//!
//! Manages physical memory pages (frames) using a bitmap allocator and binds
//! them to page table entries.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//!
//! # Security Properties
//! - Double-free is detected and causes a panic
//! - A frame is only handed out together with explicit protection flags
//! - The allocator is owned by its address space; callers that share it
//!   across CPUs wrap the owner in a spinlock

use super::address::{PhysAddr, PAGE_SHIFT};
use super::paging::{MappingError, PageFlags, PageTableEntry};

/// Size of the frame bitmap in bytes.
/// This covers 64MB of physical memory (enough for early boot).
/// 64MB / 4KB = 16384 frames = 2048 bytes = 16384 bits
const BITMAP_SIZE: usize = 2048;

/// Number of frames we can track.
pub const MAX_FRAMES: usize = BITMAP_SIZE * 8;

/// Bitmap allocator over a contiguous run of physical frames.
pub struct FrameAllocator {
    /// Bitmap tracking allocated frames (1 = allocated, 0 = free).
    bitmap: [u8; BITMAP_SIZE],
    /// First physical address under management.
    base: PhysAddr,
    /// Number of free frames remaining.
    free_count: usize,
    /// Total frames under management.
    total_frames: usize,
}

impl FrameAllocator {
    /// Create an allocator for `frames` frames starting at `base`.
    ///
    /// # Panics
    /// Panics if `base` is not page-aligned or `frames` exceeds [`MAX_FRAMES`].
    pub const fn new(base: PhysAddr, frames: usize) -> Self {
        assert!(base.is_aligned(), "frame allocator base must be page-aligned");
        assert!(frames <= MAX_FRAMES, "frame range exceeds bitmap capacity");
        Self {
            bitmap: [0; BITMAP_SIZE],
            base,
            free_count: frames,
            total_frames: frames,
        }
    }

    /// Set a bit in the bitmap.
    #[inline]
    fn set_bit(&mut self, frame: usize, allocated: bool) {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if allocated {
            self.bitmap[byte_idx] |= 1 << bit_idx;
        } else {
            self.bitmap[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Check if a frame is allocated.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if frame >= self.total_frames {
            return true; // Out of range = allocated
        }

        (self.bitmap[byte_idx] >> bit_idx) & 1 == 1
    }

    /// Claim the lowest free frame.
    fn claim(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }

        for byte_idx in 0..self.total_frames.div_ceil(8) {
            if self.bitmap[byte_idx] == 0xFF {
                continue;
            }
            for bit_idx in 0..8 {
                let frame = byte_idx * 8 + bit_idx;
                if !self.is_allocated(frame) {
                    self.set_bit(frame, true);
                    self.free_count -= 1;
                    return Some(self.base.add(frame << PAGE_SHIFT));
                }
            }
        }

        None
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// Panics if the frame is outside the managed range or not allocated.
    fn release(&mut self, addr: PhysAddr) {
        let frame = addr
            .as_usize()
            .checked_sub(self.base.as_usize())
            .map(|offset| offset >> PAGE_SHIFT)
            .filter(|&frame| frame < self.total_frames);

        let Some(frame) = frame else {
            panic!("Attempted to free frame outside managed range: {:?}", addr);
        };

        if !self.is_allocated(frame) {
            panic!("Double free detected for frame: {:?}", addr);
        }

        self.set_bit(frame, false);
        self.free_count += 1;
    }

    /// Bind a fresh frame to `entry` with the given protection.
    ///
    /// Fails with [`MappingError::AlreadyMapped`] if the entry already holds a
    /// frame, or [`MappingError::OutOfMemory`] when the pool is exhausted.
    pub fn alloc_frame(
        &mut self,
        entry: &mut PageTableEntry,
        privileged: bool,
        writable: bool,
    ) -> Result<PhysAddr, MappingError> {
        if entry.is_present() {
            return Err(MappingError::AlreadyMapped);
        }

        let addr = self.claim().ok_or(MappingError::OutOfMemory)?;
        *entry = PageTableEntry::page(addr, PageFlags::for_mapping(privileged, writable));
        Ok(addr)
    }

    /// Unbind the frame behind `entry` and return it to the pool.
    pub fn free_frame(&mut self, entry: &mut PageTableEntry) -> Result<PhysAddr, MappingError> {
        if !entry.is_present() {
            return Err(MappingError::NotMapped);
        }

        let addr = entry.addr();
        self.release(addr);
        entry.clear();
        Ok(addr)
    }

    /// Get the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Get the number of frames under management.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}
