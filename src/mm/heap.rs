//! Kernel Heap
//!
//! Variable-sized blocks carved out of one contiguous virtual range:
//!
//! ```text
//! index storage     start                                   end        max
//! +---------------+-+-------+-------+------------+------+---+----------+
//! | hole pointers | |alloc  | hole  |   alloc    | hole |...|(unmapped)|
//! +---------------+-+-------+-------+------------+------+---+----------+
//! ```
//!
//! Free blocks ("holes") are listed in an [`OrderedArray`] sorted by size that
//! lives at the bottom of the range. Allocation takes the smallest hole that
//! fits and splits it; freeing merges the block with free neighbours on both
//! sides. When nothing fits, the range grows by mapping pages up to `max`;
//! when the topmost block is freed, it shrinks back down to `min_size`.
//!
//! # Error Model
//! - Corrupted metadata (bad sentinel, stale footer, double free) panics:
//!   continuing on a damaged heap is never safe
//! - Running out of index slots, address space or frames is reported as a
//!   [`HeapError`] and leaves the heap unchanged

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use log::{debug, error, trace};

use super::address::{is_page_aligned, page_align_up, VirtAddr, PAGE_SIZE};
use super::block::{block_align_up, BlockFooter, BlockPtr, FOOTER_SIZE, HEADER_SIZE, HEAP_MAGIC, OVERHEAD};
use super::mapper::{AddressSpace, PageMapper};
use super::ordered::{IndexFull, OrderedArray};
use super::paging::MappingError;

/// Size of the kernel heap's block area when it is created.
pub const HEAP_INITIAL_SIZE: usize = 0x10_0000;
/// Default number of hole index slots.
pub const HEAP_INDEX_SIZE: usize = 0x2_0000;
/// Bytes reserved in front of the block area for the default index.
pub const HEAP_INDEX_BYTES: usize = HEAP_INDEX_SIZE * size_of::<BlockPtr>();
/// Default floor below which the heap never contracts.
pub const HEAP_MIN_SIZE: usize = 0x7_0000;

/// Creation-time heap parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Number of hole index slots reserved at the bottom of the range.
    pub index_capacity: usize,
    /// Contraction floor in bytes (rounded up to a page).
    pub min_size: usize,
    /// Map heap pages privileged-only.
    pub privileged: bool,
    /// Map heap pages read-only.
    pub readonly: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            index_capacity: HEAP_INDEX_SIZE,
            min_size: HEAP_MIN_SIZE,
            privileged: true,
            readonly: false,
        }
    }
}

/// Recoverable heap failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No index slot left for a new hole.
    IndexFull,
    /// Growing would move the end past the ceiling.
    CeilingExceeded {
        /// End address the growth would need.
        requested: usize,
        /// The heap's ceiling.
        max: usize,
    },
    /// The paging subsystem refused a mapping.
    Mapping(MappingError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexFull => write!(f, "heap hole index is full"),
            Self::CeilingExceeded { requested, max } => {
                write!(f, "heap growth to {:#x} exceeds ceiling {:#x}", requested, max)
            }
            Self::Mapping(err) => write!(f, "heap mapping failed: {}", err),
        }
    }
}

impl From<MappingError> for HeapError {
    fn from(err: MappingError) -> Self {
        Self::Mapping(err)
    }
}

impl From<IndexFull> for HeapError {
    fn from(_: IndexFull) -> Self {
        Self::IndexFull
    }
}

/// Summary produced by [`Heap::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of free blocks.
    pub holes: usize,
    /// Number of allocated blocks.
    pub allocations: usize,
    /// Bytes in free blocks, metadata included.
    pub free_bytes: usize,
    /// Bytes in allocated blocks, metadata included.
    pub used_bytes: usize,
}

/// Report corrupted heap metadata and stop.
#[cold]
#[track_caller]
fn corrupted(what: &str, addr: usize) -> ! {
    error!("heap corruption: {} at {:#x}", what, addr);
    panic!("heap corruption: {} at {:#x}", what, addr);
}

/// Index ordering: ascending hole size.
fn smaller(a: &BlockPtr, b: &BlockPtr) -> bool {
    // SAFETY: the index only ever holds headers of live holes.
    unsafe { a.size() < b.size() }
}

/// Bytes to skip at `block` so that the payload after the header is
/// page-aligned. Non-zero padding is always large enough to hold a hole.
fn leading_padding(block: usize) -> usize {
    let payload = block + HEADER_SIZE;
    let pad = page_align_up(payload) - payload;
    if pad != 0 && pad < OVERHEAD {
        pad + PAGE_SIZE
    } else {
        pad
    }
}

/// A heap over `[start, end)`, growable up to `max`.
pub struct Heap {
    index: OrderedArray<BlockPtr>,
    start: usize,
    end: usize,
    max: usize,
    min_size: usize,
    privileged: bool,
    readonly: bool,
}

// SAFETY: the heap exclusively owns its address range and index storage; the
// raw pointers inside never alias memory owned by anything else.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap over `[start, end)` that may grow up to `max`.
    ///
    /// The hole index takes the first `index_capacity` pointers of the range;
    /// blocks start at the next page boundary after it.
    ///
    /// # Safety
    /// `[start, end)` must be mapped, writable and used by nothing else, and
    /// `[end, max)` must be reserved for the heap's growth.
    ///
    /// # Panics
    /// Panics if `start` or `end` is not page-aligned, the addresses are out
    /// of order, or the index reservation leaves no room for a block.
    pub unsafe fn create(start: VirtAddr, end: VirtAddr, max: VirtAddr, config: HeapConfig) -> Self {
        assert!(start.is_aligned(), "heap start {} is not page-aligned", start);
        assert!(end.is_aligned(), "heap end {} is not page-aligned", end);
        assert!(start <= end && end <= max, "heap range {}..{} (max {}) out of order", start, end, max);
        assert!(config.index_capacity > 0, "heap index needs at least one slot");

        let index_bytes = config.index_capacity * size_of::<BlockPtr>();
        let data_start = page_align_up(start.as_usize() + index_bytes);
        assert!(
            data_start + OVERHEAD <= end.as_usize(),
            "heap index reservation of {:#x} bytes leaves no room below {}",
            index_bytes,
            end
        );

        // SAFETY: the caller hands us [start, end), which covers the index
        // reservation; a page-aligned start suits BlockPtr alignment.
        let index = unsafe {
            OrderedArray::place(start.as_mut_ptr::<BlockPtr>(), config.index_capacity, smaller)
        };

        let mut heap = Self {
            index,
            start: data_start,
            end: end.as_usize(),
            max: max.as_usize(),
            min_size: page_align_up(config.min_size),
            privileged: config.privileged,
            readonly: config.readonly,
        };

        let hole = BlockPtr::at(data_start);
        // SAFETY: [data_start, end) is inside the caller-provided range.
        unsafe { hole.write(heap.end - data_start, true) };
        heap.insert_hole(hole);

        debug!(
            "heap created: blocks {:#x}..{:#x}, max {:#x}, {} index slots",
            heap.start, heap.end, heap.max, config.index_capacity
        );
        heap
    }

    /// First byte available to blocks.
    pub fn start(&self) -> VirtAddr {
        VirtAddr::new(self.start)
    }

    /// Current end of the managed range (exclusive).
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.end)
    }

    /// Ceiling the range may grow to.
    pub fn max(&self) -> VirtAddr {
        VirtAddr::new(self.max)
    }

    /// Bytes currently managed.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Number of indexed holes.
    pub fn hole_count(&self) -> usize {
        self.index.len()
    }

    /// Holes as `(address, size)`, smallest first.
    pub fn holes(&self) -> impl Iterator<Item = (VirtAddr, usize)> + '_ {
        // SAFETY: indexed headers are live holes.
        self.index
            .iter()
            .map(|hole| (VirtAddr::new(hole.addr()), unsafe { hole.size() }))
    }

    /// Allocate `size` bytes, optionally with a page-aligned payload.
    ///
    /// Takes the smallest hole that fits, growing the heap through `aspace`
    /// when none does.
    pub fn allocate<M: PageMapper>(
        &mut self,
        size: usize,
        page_align: bool,
        aspace: &mut AddressSpace<M>,
    ) -> Result<NonNull<u8>, HeapError> {
        if size > self.max - self.start {
            return Err(HeapError::CeilingExceeded {
                requested: self.start.saturating_add(size),
                max: self.max,
            });
        }
        let needed = block_align_up(size) + OVERHEAD;

        loop {
            if let Some((pos, pad)) = self.find_smallest_hole(needed, page_align) {
                return self.carve(pos, pad, needed);
            }
            self.grow(needed, aspace)?;
        }
    }

    /// Index position of the smallest usable hole and the padding it needs.
    fn find_smallest_hole(&self, needed: usize, page_align: bool) -> Option<(usize, usize)> {
        self.index.iter().enumerate().find_map(|(pos, hole)| {
            // SAFETY: indexed headers are live holes.
            let size = unsafe { hole.size() };
            let pad = if page_align { leading_padding(hole.addr()) } else { 0 };
            (size >= pad && size - pad >= needed).then_some((pos, pad))
        })
    }

    /// Turn the hole at `pos` into an allocation of at least `needed` bytes.
    fn carve(&mut self, pos: usize, pad: usize, needed: usize) -> Result<NonNull<u8>, HeapError> {
        let hole = self.index.get(pos);
        // SAFETY: indexed headers are live holes.
        let available = unsafe { hole.size() } - pad;

        // A remainder too small for its own metadata stays with the block.
        let block_size = if available - needed < OVERHEAD {
            available
        } else {
            needed
        };
        let remainder = available - block_size;

        let inserts = usize::from(pad > 0) + usize::from(remainder > 0);
        if self.index.len() - 1 + inserts > self.index.capacity() {
            return Err(HeapError::IndexFull);
        }
        self.index.remove_at(pos);

        let block = BlockPtr::at(hole.addr() + pad);
        // SAFETY: every piece written lies inside the hole just unlinked.
        unsafe {
            if pad > 0 {
                hole.write(pad, true);
                self.insert_hole(hole);
            }
            block.write(block_size, false);
            if remainder > 0 {
                let tail = BlockPtr::at(block.addr() + block_size);
                tail.write(remainder, true);
                self.insert_hole(tail);
            }
        }

        trace!(
            "allocated {:#x} bytes at {:#x} (lead {:#x}, tail {:#x})",
            block_size,
            block.addr(),
            pad,
            remainder
        );
        // SAFETY: block >= start > 0, so the payload address is non-null.
        Ok(unsafe { NonNull::new_unchecked(block.payload()) })
    }

    /// Grow the range by at least `needed` bytes and make the new space a hole.
    fn grow<M: PageMapper>(&mut self, needed: usize, aspace: &mut AddressSpace<M>) -> Result<(), HeapError> {
        let old_end = self.end;

        // Only the highest hole can touch the old end.
        let top = self
            .index
            .iter()
            .enumerate()
            .max_by_key(|(_, hole)| hole.addr())
            // SAFETY: indexed headers are live holes.
            .filter(|(_, hole)| unsafe { hole.end() } == old_end);

        if top.is_none() && self.index.is_full() {
            return Err(HeapError::IndexFull);
        }

        self.expand(self.size().saturating_add(needed), aspace)?;
        let added = self.end - old_end;

        match top {
            Some((pos, hole)) => {
                self.index.remove_at(pos);
                // SAFETY: the hole now extends into freshly mapped pages.
                unsafe {
                    hole.set_size(hole.size() + added);
                    hole.write_footer();
                }
                self.insert_hole(hole);
            }
            None => {
                let hole = BlockPtr::at(old_end);
                // SAFETY: [old_end, end) was mapped by expand.
                unsafe { hole.write(added, true) };
                self.insert_hole(hole);
            }
        }
        Ok(())
    }

    /// Grow the managed size to `new_size` (rounded up to a page).
    ///
    /// Smaller or equal sizes leave the heap as it is.
    pub fn expand<M: PageMapper>(&mut self, new_size: usize, aspace: &mut AddressSpace<M>) -> Result<(), HeapError> {
        let old_size = self.size();
        if new_size <= old_size {
            return Ok(());
        }
        let limit = self.max - self.start;
        if new_size > limit || page_align_up(new_size) > limit {
            return Err(HeapError::CeilingExceeded {
                requested: self.start.saturating_add(new_size),
                max: self.max,
            });
        }

        let new_size = page_align_up(new_size);
        let new_end = self.start + new_size;
        aspace.map_range(
            VirtAddr::new(self.end),
            VirtAddr::new(new_end),
            self.privileged,
            !self.readonly,
        )?;

        debug!("heap expanded: {:#x} -> {:#x} bytes", old_size, new_size);
        self.end = new_end;
        Ok(())
    }

    /// Shrink the managed size toward `new_size`, never below the floor.
    ///
    /// Returns the size actually kept.
    pub fn contract<M: PageMapper>(&mut self, new_size: usize, aspace: &mut AddressSpace<M>) -> usize {
        let old_size = self.size();
        let new_size = page_align_up(new_size).max(self.min_size).min(old_size);
        if new_size == old_size {
            return old_size;
        }

        let new_end = self.start + new_size;
        aspace.unmap_range(VirtAddr::new(new_end), VirtAddr::new(self.end));

        debug!("heap contracted: {:#x} -> {:#x} bytes", old_size, new_size);
        self.end = new_end;
        new_size
    }

    /// Free the block behind `ptr`, merging it with free neighbours.
    ///
    /// A null pointer is ignored.
    ///
    /// # Safety
    /// No reference into the block's payload may outlive this call.
    ///
    /// # Panics
    /// Panics on anything that is not a live allocation of this heap: foreign
    /// pointers, damaged metadata, or a second free of the same block.
    pub unsafe fn deallocate<M: PageMapper>(&mut self, ptr: *mut u8, aspace: &mut AddressSpace<M>) {
        if ptr.is_null() {
            return;
        }

        let addr = ptr as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end {
            corrupted("pointer outside the heap", addr);
        }

        let mut block = BlockPtr::from_payload(ptr);
        // SAFETY: every header and footer touched below is bounds-checked
        // against [start, end) before it is read.
        unsafe {
            if !block.has_magic() {
                corrupted("bad header sentinel", block.addr());
            }
            let size = block.size();
            if size < OVERHEAD || size > self.end - block.addr() {
                corrupted("bad block size", block.addr());
            }
            if !block.footer_matches() {
                corrupted("bad footer", block.footer() as usize);
            }
            if block.is_hole() {
                corrupted("double free", block.addr());
            }
            block.set_hole(true);

            if block.addr() > self.start {
                let footer = (block.addr() - FOOTER_SIZE) as *const BlockFooter;
                if (*footer).magic != HEAP_MAGIC {
                    corrupted("bad footer sentinel left of block", footer as usize);
                }
                let left = BlockPtr::from_footer(footer);
                if left.addr() < self.start || left.addr() >= block.addr() || !left.has_magic() {
                    corrupted("bad left neighbour", left.addr());
                }
                if left.is_hole() {
                    trace!("unify left {:#x} + {:#x}", left.addr(), block.addr());
                    self.remove_hole(left);
                    left.set_size(left.size() + block.size());
                    block = left;
                }
            }

            let next = block.end();
            if next < self.end {
                let right = BlockPtr::at(next);
                if !right.has_magic() {
                    corrupted("bad right neighbour", next);
                }
                if right.is_hole() {
                    trace!("unify right {:#x} + {:#x}", block.addr(), right.addr());
                    self.remove_hole(right);
                    block.set_size(block.size() + right.size());
                }
            }
            block.write_footer();

            if block.end() == self.end {
                let old_size = self.size();
                let offset = block.addr() - self.start;
                // Keep a surviving tail large enough for its own metadata.
                let target = if is_page_aligned(offset) {
                    offset
                } else {
                    offset + OVERHEAD
                };
                let shrink = old_size - self.contract(target, aspace);
                if shrink >= block.size() {
                    trace!("hole at {:#x} released with the heap tail", block.addr());
                    return;
                }
                if shrink > 0 {
                    block.set_size(block.size() - shrink);
                    block.write_footer();
                }
            }
        }

        self.insert_hole(block);
    }

    /// Index a hole; running out of slots here is fatal.
    fn insert_hole(&mut self, hole: BlockPtr) {
        if let Err(full) = self.index.insert(hole) {
            error!("cannot index hole at {:#x}: {}", hole.addr(), full);
            panic!("heap hole index exhausted: {}", full);
        }
    }

    /// Drop a hole from the index, locating it by address.
    fn remove_hole(&mut self, hole: BlockPtr) {
        match self.index.position(|h| h == hole) {
            Some(pos) => {
                self.index.remove_at(pos);
            }
            None => corrupted("hole missing from index", hole.addr()),
        }
    }

    /// Walk every block and verify the heap's invariants.
    ///
    /// # Panics
    /// Panics if blocks do not tile `[start, end)`, metadata is damaged, two
    /// holes sit side by side, or the index disagrees with the holes found.
    pub fn check(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut addr = self.start;
        let mut prev_hole = false;

        while addr < self.end {
            let block = BlockPtr::at(addr);
            // SAFETY: addr lies inside the managed range and is either start
            // or the end of a block verified on the previous iteration.
            unsafe {
                if !block.has_magic() {
                    corrupted("bad header sentinel", addr);
                }
                let size = block.size();
                if size < OVERHEAD || size > self.end - addr {
                    corrupted("bad block size", addr);
                }
                if !block.footer_matches() {
                    corrupted("bad footer", block.footer() as usize);
                }
                if block.is_hole() {
                    if prev_hole {
                        corrupted("adjacent holes not coalesced", addr);
                    }
                    if self.index.iter().filter(|&h| h == block).count() != 1 {
                        corrupted("hole not indexed exactly once", addr);
                    }
                    stats.holes += 1;
                    stats.free_bytes += size;
                } else {
                    stats.allocations += 1;
                    stats.used_bytes += size;
                }
                prev_hole = block.is_hole();
                addr += size;
            }
        }

        if addr != self.end {
            corrupted("blocks overrun the heap end", addr);
        }
        if self.index.len() != stats.holes {
            corrupted("index holds entries that are not holes", self.start);
        }
        for i in 1..self.index.len() {
            if smaller(&self.index.get(i), &self.index.get(i - 1)) {
                corrupted("index out of order", self.index.get(i).addr());
            }
        }
        stats
    }
}
