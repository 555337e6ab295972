//! Host memory standing in for the kernel's virtual address space in tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::frame::FrameAllocator;
use super::mapper::{AddressSpace, PageWindow, TABLE_SPAN};
use super::paging::PageTable;

/// Physical address of the first frame handed out in tests.
pub const FRAME_BASE: usize = 0x4000_0000;

/// Page-aligned host buffer whose addresses are used as heap addresses.
pub struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "test arena allocation failed");
        Self { ptr, layout }
    }

    pub fn base(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.ptr)
    }

    /// Address of page `n` of the arena.
    pub fn page(&self, n: usize) -> VirtAddr {
        self.base().add(n * PAGE_SIZE)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Address space covering `pages` pages from `base`, with `frames` frames.
///
/// The page tables are leaked so the window can be `'static`.
pub fn address_space(base: VirtAddr, pages: usize, frames: usize) -> AddressSpace<PageWindow<'static>> {
    let tables: Vec<PageTable> = (0..(pages * PAGE_SIZE).div_ceil(TABLE_SPAN))
        .map(|_| PageTable::new())
        .collect();
    let tables = Box::leak(tables.into_boxed_slice());
    AddressSpace::new(
        PageWindow::new(base, tables),
        FrameAllocator::new(PhysAddr::new(FRAME_BASE), frames),
    )
}
