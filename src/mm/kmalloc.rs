//! Kernel Allocation Entry Points
//!
//! Before paging is up there is no heap, only a bump pointer running upward
//! from the end of the kernel image. [`KernelAllocator`] owns that cursor,
//! the address space and, once created, the [`Heap`], and routes every
//! `kmalloc` to whichever of them is live:
//!
//! ```text
//! Uninitialized --init_placement--> Placement --create_heap--> HeapActive
//! ```
//!
//! Placement memory is never reclaimed; `kfree` only returns memory to the heap.

use core::ptr::NonNull;

use log::{debug, trace, warn};

use super::address::{page_align_up, PhysAddr, VirtAddr};
use super::heap::{Heap, HeapConfig, HeapError};
use super::mapper::{AddressSpace, PageMapper};
use super::paging::MappingError;

/// Where allocations currently come from.
enum State {
    /// No allocation is possible yet.
    Uninitialized,
    /// Bump allocation from `cursor`.
    Placement { cursor: usize },
    /// The heap serves every request.
    HeapActive(Heap),
}

/// The kernel's allocator context.
pub struct KernelAllocator<M: PageMapper> {
    state: State,
    aspace: AddressSpace<M>,
}

impl<M: PageMapper> KernelAllocator<M> {
    /// Wrap `aspace`; allocation is refused until [`Self::init_placement`].
    pub const fn new(aspace: AddressSpace<M>) -> Self {
        Self {
            state: State::Uninitialized,
            aspace,
        }
    }

    /// Start bump allocation at `kernel_end`, the first byte past the kernel.
    ///
    /// # Panics
    /// Panics if placement was already set up.
    pub fn init_placement(&mut self, kernel_end: VirtAddr) {
        match self.state {
            State::Uninitialized => {
                debug!("placement allocation from {}", kernel_end);
                self.state = State::Placement {
                    cursor: kernel_end.as_usize(),
                };
            }
            _ => panic!("placement allocator initialized twice"),
        }
    }

    /// Map `[start, end)` and move all further allocation onto a new heap.
    ///
    /// # Safety
    /// See [`Self::create_heap_with`].
    pub unsafe fn create_heap(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        max: VirtAddr,
        privileged: bool,
        readonly: bool,
    ) -> Result<(), HeapError> {
        let config = HeapConfig {
            privileged,
            readonly,
            ..HeapConfig::default()
        };
        // SAFETY: forwarded to the caller.
        unsafe { self.create_heap_with(start, end, max, config) }
    }

    /// [`Self::create_heap`] with explicit heap parameters.
    ///
    /// # Safety
    /// `[start, max)` must be virtual address space reserved for the heap,
    /// and mapping a page through this allocator's address space must make it
    /// accessible.
    ///
    /// # Panics
    /// Panics if a heap already exists.
    pub unsafe fn create_heap_with(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        max: VirtAddr,
        config: HeapConfig,
    ) -> Result<(), HeapError> {
        if let State::HeapActive(_) = self.state {
            panic!("kernel heap created twice");
        }

        self.aspace
            .map_range(start, end, config.privileged, !config.readonly)?;
        // SAFETY: [start, end) was just mapped; the rest is the caller's promise.
        let heap = unsafe { Heap::create(start, end, max, config) };

        if let State::Placement { cursor } = self.state {
            debug!("placement retired at {:#x}, heap active", cursor);
        }
        self.state = State::HeapActive(heap);
        Ok(())
    }

    /// Allocate `size` bytes, optionally page-aligned, optionally reporting
    /// the physical address behind the result.
    ///
    /// # Panics
    /// Panics before [`Self::init_placement`] and when the placement cursor
    /// would wrap.
    pub fn kmalloc_int(
        &mut self,
        size: usize,
        align: bool,
        want_phys: bool,
    ) -> Result<(VirtAddr, Option<PhysAddr>), HeapError> {
        match &mut self.state {
            State::Uninitialized => panic!("kmalloc before the placement allocator was set up"),
            State::Placement { cursor } => {
                if align {
                    *cursor = page_align_up(*cursor);
                }
                let addr = *cursor;
                *cursor = addr
                    .checked_add(size)
                    .unwrap_or_else(|| panic!("placement cursor overflow at {:#x}", addr));
                trace!("placement {:#x} bytes at {:#x}", size, addr);
                // Memory below the heap is identity mapped.
                let phys = want_phys.then(|| PhysAddr::new(addr));
                Ok((VirtAddr::new(addr), phys))
            }
            State::HeapActive(heap) => {
                let ptr = heap.allocate(size, align, &mut self.aspace)?;
                let virt = VirtAddr::from_ptr(ptr.as_ptr());
                let phys = if want_phys {
                    let phys = self
                        .aspace
                        .translate(virt)
                        .ok_or(HeapError::Mapping(MappingError::NotMapped))?;
                    Some(phys)
                } else {
                    None
                };
                Ok((virt, phys))
            }
        }
    }

    /// Allocate `size` bytes.
    pub fn kmalloc(&mut self, size: usize) -> Result<VirtAddr, HeapError> {
        self.kmalloc_int(size, false, false).map(|(virt, _)| virt)
    }

    /// Allocate `size` bytes on a page boundary.
    pub fn kmalloc_a(&mut self, size: usize) -> Result<VirtAddr, HeapError> {
        self.kmalloc_int(size, true, false).map(|(virt, _)| virt)
    }

    /// Allocate `size` bytes and report their physical address.
    pub fn kmalloc_p(&mut self, size: usize) -> Result<(VirtAddr, PhysAddr), HeapError> {
        self.kmalloc_int(size, false, true).map(with_phys)
    }

    /// Allocate `size` page-aligned bytes and report their physical address.
    pub fn kmalloc_ap(&mut self, size: usize) -> Result<(VirtAddr, PhysAddr), HeapError> {
        self.kmalloc_int(size, true, true).map(with_phys)
    }

    /// Return `ptr` to the heap. Null is ignored.
    ///
    /// Before the heap exists nothing can be freed; the pointer is logged and
    /// dropped.
    ///
    /// # Safety
    /// See [`Heap::deallocate`].
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        match &mut self.state {
            State::HeapActive(heap) => {
                // SAFETY: forwarded to the caller.
                unsafe { heap.deallocate(ptr, &mut self.aspace) }
            }
            _ if ptr.is_null() => {}
            _ => warn!("kfree({:p}) before the heap exists, ignored", ptr),
        }
    }

    /// Allocate through the heap only, for callers that cannot use placement
    /// memory. Returns `None` before the heap exists.
    pub(crate) fn heap_alloc(&mut self, size: usize, align: bool) -> Option<Result<NonNull<u8>, HeapError>> {
        match &mut self.state {
            State::HeapActive(heap) => Some(heap.allocate(size, align, &mut self.aspace)),
            _ => None,
        }
    }

    /// Whether allocations are served by the heap.
    pub fn is_heap_active(&self) -> bool {
        matches!(self.state, State::HeapActive(_))
    }

    /// The heap, once created.
    pub fn heap(&self) -> Option<&Heap> {
        match &self.state {
            State::HeapActive(heap) => Some(heap),
            _ => None,
        }
    }

    /// Next placement address, while placement is active.
    pub fn placement_cursor(&self) -> Option<VirtAddr> {
        match self.state {
            State::Placement { cursor } => Some(VirtAddr::new(cursor)),
            _ => None,
        }
    }

    /// The address space heap pages are mapped into.
    pub fn address_space(&self) -> &AddressSpace<M> {
        &self.aspace
    }
}

fn with_phys((virt, phys): (VirtAddr, Option<PhysAddr>)) -> (VirtAddr, PhysAddr) {
    match phys {
        Some(phys) => (virt, phys),
        None => unreachable!("physical address requested but not resolved"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::PAGE_SIZE;
    use crate::mm::heap::{HEAP_INDEX_BYTES, HEAP_INITIAL_SIZE};
    use crate::mm::mapper::PageWindow;
    use crate::mm::testing::{self, Arena};

    const KERNEL_END: usize = 0x10_0010;

    fn placement() -> KernelAllocator<PageWindow<'static>> {
        let mut kalloc = KernelAllocator::new(testing::address_space(VirtAddr::new(0xC000_0000), 1, 1));
        kalloc.init_placement(VirtAddr::new(KERNEL_END));
        kalloc
    }

    fn small_config() -> HeapConfig {
        HeapConfig {
            index_capacity: 64,
            min_size: 7 * PAGE_SIZE,
            ..HeapConfig::default()
        }
    }

    /// Placement at `KERNEL_END`, then a heap over the first 8 of 32 arena pages.
    fn with_heap(arena: &Arena) -> KernelAllocator<PageWindow<'static>> {
        let mut kalloc = KernelAllocator::new(testing::address_space(arena.base(), 32, 32));
        kalloc.init_placement(VirtAddr::new(KERNEL_END));
        // SAFETY: the arena backs [base, page(32)) for the test's lifetime.
        unsafe {
            kalloc
                .create_heap_with(arena.base(), arena.page(8), arena.page(32), small_config())
                .unwrap();
        }
        kalloc
    }

    #[test]
    fn test_placement_bumps_cursor() {
        let mut kalloc = placement();
        assert_eq!(kalloc.kmalloc(10).unwrap(), VirtAddr::new(KERNEL_END));
        assert_eq!(kalloc.kmalloc(6).unwrap(), VirtAddr::new(KERNEL_END + 10));
        assert_eq!(kalloc.placement_cursor(), Some(VirtAddr::new(KERNEL_END + 16)));
    }

    #[test]
    fn test_placement_alignment() {
        let mut kalloc = placement();
        let page = kalloc.kmalloc_a(0x20).unwrap();
        assert_eq!(page, VirtAddr::new(0x10_1000));

        // Already on a boundary: not bumped another page.
        kalloc.kmalloc(PAGE_SIZE - 0x20).unwrap();
        assert_eq!(kalloc.kmalloc_a(8).unwrap(), VirtAddr::new(0x10_2000));
    }

    #[test]
    fn test_placement_reports_identity_phys() {
        let mut kalloc = placement();
        let (virt, phys) = kalloc.kmalloc_p(32).unwrap();
        assert_eq!(phys.as_usize(), virt.as_usize());
        let (virt, phys) = kalloc.kmalloc_ap(32).unwrap();
        assert!(virt.is_aligned());
        assert_eq!(phys.as_usize(), virt.as_usize());
    }

    #[test]
    fn test_kfree_before_heap_is_ignored() {
        let mut kalloc = placement();
        let virt = kalloc.kmalloc(64).unwrap();
        // SAFETY: placement memory is never touched by kfree.
        unsafe { kalloc.kfree(virt.as_mut_ptr()) };
        assert_eq!(kalloc.placement_cursor(), Some(VirtAddr::new(KERNEL_END + 64)));
    }

    #[test]
    #[should_panic(expected = "before the placement allocator")]
    fn test_kmalloc_uninitialized_panics() {
        let mut kalloc = KernelAllocator::new(testing::address_space(VirtAddr::new(0xC000_0000), 1, 1));
        let _ = kalloc.kmalloc(8);
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_placement_init_panics() {
        let mut kalloc = placement();
        kalloc.init_placement(VirtAddr::new(KERNEL_END));
    }

    #[test]
    fn test_heap_takes_over() {
        let arena = Arena::new(32);
        let mut kalloc = with_heap(&arena);
        assert!(kalloc.is_heap_active());
        assert_eq!(kalloc.placement_cursor(), None);
        assert_eq!(kalloc.address_space().mapper().mapped_pages(), 8);

        let virt = kalloc.kmalloc(100).unwrap();
        let heap = kalloc.heap().unwrap();
        assert!(virt >= heap.start() && virt < heap.end());
        assert_eq!(heap.check().allocations, 1);
    }

    #[test]
    fn test_heap_phys_matches_translation() {
        let arena = Arena::new(32);
        let mut kalloc = with_heap(&arena);

        let (virt, phys) = kalloc.kmalloc_p(100).unwrap();
        let entry = kalloc.aspace.entry(virt).unwrap();
        assert_eq!(
            phys.as_usize(),
            entry.frame_number() * PAGE_SIZE + virt.page_offset()
        );

        let (virt, phys) = kalloc.kmalloc_ap(100).unwrap();
        assert!(virt.is_aligned());
        assert!(phys.is_aligned());
        assert_eq!(kalloc.aspace.translate(virt), Some(phys));
    }

    #[test]
    fn test_kfree_returns_memory() {
        let arena = Arena::new(32);
        let mut kalloc = with_heap(&arena);
        let before = kalloc.heap().unwrap().check();

        let a = kalloc.kmalloc(200).unwrap();
        let b = kalloc.kmalloc_a(300).unwrap();
        // SAFETY: both came from this allocator and are not referenced.
        unsafe {
            kalloc.kfree(b.as_mut_ptr());
            kalloc.kfree(a.as_mut_ptr());
            kalloc.kfree(core::ptr::null_mut());
        }
        assert_eq!(kalloc.heap().unwrap().check(), before);
    }

    #[test]
    fn test_heap_growth_through_kmalloc() {
        let arena = Arena::new(32);
        let mut kalloc = with_heap(&arena);
        let virt = kalloc.kmalloc(12 * PAGE_SIZE).unwrap();
        let heap = kalloc.heap().unwrap();
        assert!(heap.end() > arena.page(8));
        assert!(virt.add(12 * PAGE_SIZE) <= heap.end());
        assert_eq!(
            kalloc.address_space().mapper().mapped_pages(),
            (heap.end().as_usize() - arena.base().as_usize()) / PAGE_SIZE
        );
    }

    #[test]
    fn test_default_heap_layout() {
        let pages = (HEAP_INDEX_BYTES + HEAP_INITIAL_SIZE) / PAGE_SIZE;
        let arena = Arena::new(pages + 16);
        let mut kalloc = KernelAllocator::new(testing::address_space(arena.base(), pages + 16, pages + 16));
        // SAFETY: the arena backs the whole range for the test's lifetime.
        unsafe {
            kalloc
                .create_heap(arena.base(), arena.page(pages), arena.page(pages + 16), true, false)
                .unwrap();
        }
        let heap = kalloc.heap().unwrap();
        assert_eq!(heap.start(), arena.base().add(HEAP_INDEX_BYTES));
        assert_eq!(heap.size(), HEAP_INITIAL_SIZE);
        assert!(kalloc.aspace.entry(arena.page(0)).unwrap().is_privileged());
    }

    #[test]
    fn test_heap_mapping_failure_keeps_placement() {
        let arena = Arena::new(8);
        let mut kalloc = KernelAllocator::new(testing::address_space(arena.base(), 8, 4));
        kalloc.init_placement(VirtAddr::new(KERNEL_END));
        // SAFETY: the arena backs the whole range for the test's lifetime.
        let result = unsafe { kalloc.create_heap_with(arena.base(), arena.page(8), arena.page(8), small_config()) };
        assert_eq!(result, Err(HeapError::Mapping(MappingError::OutOfMemory)));
        assert!(!kalloc.is_heap_active());
        assert_eq!(kalloc.kmalloc(8).unwrap(), VirtAddr::new(KERNEL_END));
        assert_eq!(kalloc.address_space().frames().free_frames(), 4);
    }

    #[test]
    #[should_panic(expected = "created twice")]
    fn test_second_heap_panics() {
        let arena = Arena::new(32);
        let mut kalloc = with_heap(&arena);
        // SAFETY: never reached past the panic.
        let _ = unsafe { kalloc.create_heap_with(arena.base(), arena.page(8), arena.page(32), small_config()) };
    }
}
