//! Page Table Entries
//!
//! The leaf level of the paging subsystem, which is all the heap ever
//! touches: one entry per 4 KiB page, holding a physical frame number and a
//! set of protection flags.
//!
//! # Entry Layout
//! - Bits [11:0]: flags ([`PageFlags`])
//! - Bits [63:12]: physical frame number
//!
//! # Security Properties
//! - Page flags are strictly typed to prevent invalid combinations
//! - Privileged-only and read-only mappings are expressed in the flags
//!   at frame allocation time and never widened afterwards

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, PAGE_SHIFT};

/// Number of entries per page table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// A frame is bound to this entry.
        const PRESENT = 1 << 0;
        /// Writes are permitted.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode (clear = privileged-only).
        const USER = 1 << 2;
    }
}

impl PageFlags {
    /// Protection flags for a fresh mapping.
    #[inline]
    pub fn for_mapping(privileged: bool, writable: bool) -> Self {
        let mut flags = Self::PRESENT;
        flags.set(Self::WRITABLE, writable);
        flags.set(Self::USER, !privileged);
        flags
    }
}

/// A single page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Mask of the flag bits.
    const FLAGS_MASK: u64 = (1 << PAGE_SHIFT) - 1;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create an entry mapping a physical frame.
    #[inline]
    pub fn page(phys: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(phys.is_aligned());
        Self(((phys.page_frame_number() as u64) << PAGE_SHIFT) | flags.bits())
    }

    /// Check if a frame is bound to this entry.
    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// The physical frame index behind this entry.
    #[inline]
    pub const fn frame_number(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Get the physical address of the frame.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::from_page_frame_number(self.frame_number())
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Check whether the mapping is restricted to privileged code.
    #[inline]
    pub fn is_privileged(self) -> bool {
        !self.flags().contains(PageFlags::USER)
    }

    /// Check whether the mapping permits writes.
    #[inline]
    pub fn is_writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::invalid()
    }
}

/// One page table: 512 leaf entries, covering 2 MiB of address space.
///
/// The table must be 4KB aligned in physical memory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all present entries with their indices.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// No physical frames available.
    OutOfMemory,
    /// The address is not properly aligned.
    MisalignedAddress,
    /// No page table covers the virtual address.
    NoPageTable,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfMemory => write!(f, "out of physical frames"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::NoPageTable => write!(f, "no page table covers the address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_frame_number() {
        let entry = PageTableEntry::page(
            PhysAddr::new(0x4020_3000),
            PageFlags::for_mapping(true, true),
        );
        assert!(entry.is_present());
        assert_eq!(entry.frame_number(), 0x4020_3);
        assert_eq!(entry.addr(), PhysAddr::new(0x4020_3000));
    }

    #[test]
    fn test_mapping_flags() {
        let kernel_rw = PageFlags::for_mapping(true, true);
        assert!(kernel_rw.contains(PageFlags::WRITABLE));
        assert!(!kernel_rw.contains(PageFlags::USER));

        let user_ro = PageTableEntry::page(PhysAddr::new(0x1000), PageFlags::for_mapping(false, false));
        assert!(!user_ro.is_privileged());
        assert!(!user_ro.is_writable());
    }

    #[test]
    fn test_clear_entry() {
        let mut entry = PageTableEntry::page(PhysAddr::new(0x2000), PageFlags::PRESENT);
        entry.clear();
        assert!(!entry.is_present());
        assert_eq!(entry, PageTableEntry::invalid());
    }
}
