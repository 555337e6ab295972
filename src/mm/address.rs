//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time.
//!
//! # Security Properties
//! - Physical addresses cannot be dereferenced directly
//! - Virtual addresses require explicit unsafe conversion to pointers
//! - Page rounding lives in one place so heap and placement agree on it

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Round a byte count or address up to the next page boundary.
///
/// Values already on a boundary are returned unchanged.
#[inline]
pub const fn page_align_up(value: usize) -> usize {
    (value + PAGE_MASK) & !PAGE_MASK
}

/// Round a byte count or address down to a page boundary.
#[inline]
pub const fn page_align_down(value: usize) -> usize {
    value & !PAGE_MASK
}

/// Check whether a byte count or address sits on a page boundary.
#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & PAGE_MASK == 0
}

/// A physical memory address.
///
/// This is a newtype wrapper that prevents accidental mixing of
/// physical and virtual addresses. Physical addresses cannot be
/// directly dereferenced - they must be mapped to virtual addresses first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    /// Get the page frame number.
    #[inline]
    pub const fn page_frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Create from a page frame number.
    #[inline]
    pub const fn from_page_frame_number(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual memory address.
///
/// Heap bookkeeping is done in plain `usize` arithmetic; this type marks the
/// addresses that cross into the paging subsystem and out to callers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Take the address of a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(page_align_down(self.0))
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self(page_align_up(self.0))
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid, properly mapped,
    /// and that mutable access is safe.
    #[inline]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
