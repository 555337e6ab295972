//! Page Table Mapper
//!
//! High-level API for managing virtual memory mappings.
//! This module provides safe wrappers for page table manipulation.
//!
//! # Design
//! - [`PageMapper`] is the seam to the architecture: it hands out the leaf
//!   entry for a virtual address, creating intermediate tables on request
//! - [`PageWindow`] is the software implementation used during early boot
//!   (and under test): a fixed run of leaf tables covering one window of the
//!   address space
//! - [`AddressSpace`] pairs a mapper with the [`FrameAllocator`] so that
//!   mapping a page means binding a fresh frame to its entry
//!
//! # Security Properties
//! - All mappings require explicit protection flags
//! - The mapper validates alignment before modifying page tables
//! - Partially mapped ranges are rolled back on failure

use log::{trace, warn};

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::frame::FrameAllocator;
use super::paging::{MappingError, PageTable, PageTableEntry, ENTRIES_PER_TABLE};

/// Bytes of address space covered by one leaf table.
pub const TABLE_SPAN: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Access to the leaf page table entries of an address space.
pub trait PageMapper {
    /// Get the entry for `virt`.
    ///
    /// With `create` set, missing intermediate tables are created; otherwise
    /// `None` is returned for addresses whose table does not exist yet.
    fn get_page(&mut self, virt: VirtAddr, create: bool) -> Option<&mut PageTableEntry>;
}

/// A window of the address space backed by caller-supplied leaf tables.
///
/// Table `i` covers the `ENTRIES_PER_TABLE` pages starting at
/// `base + i * TABLE_SPAN`. A table counts as created once an entry in it has
/// been requested with `create`.
pub struct PageWindow<'a> {
    base: VirtAddr,
    tables: &'a mut [PageTable],
    /// Bit `i` set = table `i` has been created.
    live: u64,
}

impl<'a> PageWindow<'a> {
    /// Maximum number of leaf tables in one window.
    pub const MAX_TABLES: usize = u64::BITS as usize;

    /// Create a window starting at `base`.
    ///
    /// # Panics
    /// Panics if `base` is not page-aligned or more than
    /// [`Self::MAX_TABLES`] tables are supplied.
    pub fn new(base: VirtAddr, tables: &'a mut [PageTable]) -> Self {
        assert!(base.is_aligned(), "page window base must be page-aligned");
        assert!(tables.len() <= Self::MAX_TABLES, "too many page tables for one window");
        for table in tables.iter_mut() {
            table.clear();
        }
        Self {
            base,
            tables,
            live: 0,
        }
    }

    /// First address past the window.
    pub fn end(&self) -> VirtAddr {
        self.base.add(self.tables.len() * TABLE_SPAN)
    }

    /// Number of pages with a frame bound to them.
    pub fn mapped_pages(&self) -> usize {
        self.tables
            .iter()
            .map(|table| table.iter_present().count())
            .sum()
    }
}

impl PageMapper for PageWindow<'_> {
    fn get_page(&mut self, virt: VirtAddr, create: bool) -> Option<&mut PageTableEntry> {
        let offset = virt.as_usize().checked_sub(self.base.as_usize())?;
        let table_idx = offset / TABLE_SPAN;
        let entry_idx = (offset % TABLE_SPAN) / PAGE_SIZE;
        if table_idx >= self.tables.len() {
            return None;
        }

        let bit = 1u64 << table_idx;
        if self.live & bit == 0 {
            if !create {
                return None;
            }
            self.live |= bit;
        }
        Some(&mut self.tables[table_idx][entry_idx])
    }
}

/// A page mapper together with the frames it maps.
pub struct AddressSpace<M: PageMapper> {
    mapper: M,
    frames: FrameAllocator,
}

impl<M: PageMapper> AddressSpace<M> {
    /// Combine a mapper with a frame pool.
    pub const fn new(mapper: M, frames: FrameAllocator) -> Self {
        Self { mapper, frames }
    }

    /// Bind a fresh frame to the page at `virt`.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        privileged: bool,
        writable: bool,
    ) -> Result<PhysAddr, MappingError> {
        if !virt.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        let entry = self
            .mapper
            .get_page(virt, true)
            .ok_or(MappingError::NoPageTable)?;
        let phys = self.frames.alloc_frame(entry, privileged, writable)?;
        trace!("mapped {} -> {}", virt, phys);
        Ok(phys)
    }

    /// Release the frame behind the page at `virt`.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysAddr, MappingError> {
        if !virt.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        let entry = self
            .mapper
            .get_page(virt, false)
            .ok_or(MappingError::NotMapped)?;
        let phys = self.frames.free_frame(entry)?;
        trace!("unmapped {} (frame {})", virt, phys);
        Ok(phys)
    }

    /// Map every page in `[start, end)`.
    ///
    /// On failure the pages mapped by this call are released again.
    pub fn map_range(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        privileged: bool,
        writable: bool,
    ) -> Result<(), MappingError> {
        if !start.is_aligned() || !end.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }

        let mut page = start;
        while page < end {
            if let Err(err) = self.map_page(page, privileged, writable) {
                self.unmap_range(start, page);
                return Err(err);
            }
            page = page.add(PAGE_SIZE);
        }
        Ok(())
    }

    /// Release every page in `[start, end)`, highest page first.
    ///
    /// Pages without a frame are skipped; any other failure is logged and
    /// the walk continues.
    pub fn unmap_range(&mut self, start: VirtAddr, end: VirtAddr) {
        let mut page = end;
        while page > start {
            page = VirtAddr::new(page.as_usize() - PAGE_SIZE);
            match self.unmap_page(page) {
                Ok(_) | Err(MappingError::NotMapped) => {}
                Err(err) => warn!("unmap of {} failed: {}", page, err),
            }
        }
    }

    /// Translate `virt` to its physical address, if mapped.
    pub fn translate(&mut self, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.mapper.get_page(virt.align_down(), false)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::from_page_frame_number(entry.frame_number()).add(virt.page_offset()))
    }

    /// Look up the entry for `virt` without creating tables.
    pub fn entry(&mut self, virt: VirtAddr) -> Option<PageTableEntry> {
        self.mapper.get_page(virt.align_down(), false).copied()
    }

    /// The frame pool.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// The page mapper.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::paging::PageFlags;

    const WINDOW_BASE: usize = 0xC000_0000;

    fn tables(n: usize) -> Vec<PageTable> {
        (0..n).map(|_| PageTable::new()).collect()
    }

    #[test]
    fn test_window_create_flag() {
        let mut storage = tables(2);
        let mut window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let va = VirtAddr::new(WINDOW_BASE + TABLE_SPAN + 3 * PAGE_SIZE);

        assert!(window.get_page(va, false).is_none());
        assert!(window.get_page(va, true).is_some());
        assert!(window.get_page(va, false).is_some());
        assert!(window.get_page(window.end(), true).is_none());
        assert!(window.get_page(VirtAddr::new(WINDOW_BASE - PAGE_SIZE), true).is_none());
    }

    #[test]
    fn test_map_translate_unmap() {
        let mut storage = tables(1);
        let window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let mut space = AddressSpace::new(window, FrameAllocator::new(PhysAddr::new(0x10_0000), 8));

        let va = VirtAddr::new(WINDOW_BASE + 2 * PAGE_SIZE);
        let phys = space.map_page(va, true, false).unwrap();
        assert_eq!(space.translate(va.add(0x123)), Some(phys.add(0x123)));

        let entry = space.entry(va).unwrap();
        assert!(!entry.flags().contains(PageFlags::WRITABLE));
        assert!(entry.is_privileged());

        assert_eq!(space.unmap_page(va), Ok(phys));
        assert_eq!(space.translate(va), None);
        assert_eq!(space.frames().free_frames(), 8);
    }

    #[test]
    fn test_map_range_rolls_back() {
        let mut storage = tables(1);
        let window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let mut space = AddressSpace::new(window, FrameAllocator::new(PhysAddr::new(0x10_0000), 3));

        let start = VirtAddr::new(WINDOW_BASE);
        let result = space.map_range(start, start.add(4 * PAGE_SIZE), true, true);
        assert_eq!(result, Err(MappingError::OutOfMemory));
        assert_eq!(space.frames().free_frames(), 3);
        assert_eq!(space.mapper().mapped_pages(), 0);
    }

    #[test]
    fn test_unmap_range_skips_holes() {
        let mut storage = tables(1);
        let window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let mut space = AddressSpace::new(window, FrameAllocator::new(PhysAddr::new(0x10_0000), 4));

        let start = VirtAddr::new(WINDOW_BASE);
        space.map_page(start, true, true).unwrap();
        space.map_page(start.add(2 * PAGE_SIZE), true, true).unwrap();

        space.unmap_range(start, start.add(4 * PAGE_SIZE));
        assert_eq!(space.mapper().mapped_pages(), 0);
        assert_eq!(space.frames().free_frames(), 4);
    }

    #[test]
    fn test_unmap_range_continues_past_misaligned_start() {
        let mut storage = tables(1);
        let window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let mut space = AddressSpace::new(window, FrameAllocator::new(PhysAddr::new(0x10_0000), 4));

        let start = VirtAddr::new(WINDOW_BASE);
        space.map_range(start, start.add(2 * PAGE_SIZE), true, true).unwrap();

        // The end is off a page boundary: every step of the walk is misaligned.
        space.unmap_range(start, start.add(2 * PAGE_SIZE + 8));
        assert_eq!(space.mapper().mapped_pages(), 2);
        space.unmap_range(start, start.add(2 * PAGE_SIZE));
        assert_eq!(space.mapper().mapped_pages(), 0);
    }

    #[test]
    fn test_misaligned_map() {
        let mut storage = tables(1);
        let window = PageWindow::new(VirtAddr::new(WINDOW_BASE), &mut storage);
        let mut space = AddressSpace::new(window, FrameAllocator::new(PhysAddr::new(0x10_0000), 1));
        assert_eq!(
            space.map_page(VirtAddr::new(WINDOW_BASE + 8), true, true),
            Err(MappingError::MisalignedAddress)
        );
    }
}
