//! Kernel Global Allocator
//!
//! Puts the [`KernelAllocator`] behind a spinlock so it can serve Rust's
//! `alloc` crate. The kernel installs it once paging is up:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: LockedKernelAllocator<KernelMapper> = LockedKernelAllocator::empty();
//!
//! ALLOCATOR.init(kernel_allocator);
//! ```
//!
//! # Security Considerations
//! - Only heap memory is handed out; placement memory cannot be freed and is
//!   never returned from `alloc`
//! - Alignments above a page are refused rather than over-allocated
//! - Any allocation failure becomes a null pointer for `handle_alloc_error`

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use log::warn;
use spin::Mutex;

use super::address::PAGE_SIZE;
use super::block::BLOCK_ALIGN;
use super::kmalloc::KernelAllocator;
use super::mapper::PageMapper;

/// A [`KernelAllocator`] shared behind a [`spin::Mutex`].
pub struct LockedKernelAllocator<M: PageMapper> {
    inner: Mutex<Option<KernelAllocator<M>>>,
}

impl<M: PageMapper> LockedKernelAllocator<M> {
    /// An allocator that refuses every request until [`Self::init`].
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install the allocator context.
    ///
    /// # Panics
    /// Panics if called twice.
    pub fn init(&self, allocator: KernelAllocator<M>) {
        let mut inner = self.inner.lock();
        assert!(inner.is_none(), "global allocator initialized twice");
        *inner = Some(allocator);
    }

    /// Run `f` on the context with the lock held.
    ///
    /// Returns `None` before [`Self::init`].
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelAllocator<M>) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

// SAFETY: every request is serialized by the mutex, blocks handed out are
// disjoint, and a failed request yields null.
unsafe impl<M: PageMapper> GlobalAlloc for LockedKernelAllocator<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let page_align = match layout.align() {
            align if align <= BLOCK_ALIGN => false,
            align if align <= PAGE_SIZE => true,
            _ => return ptr::null_mut(),
        };

        match self.with(|kalloc| kalloc.heap_alloc(layout.size(), page_align)) {
            Some(Some(Ok(ptr))) => ptr.as_ptr(),
            Some(Some(Err(err))) => {
                warn!("allocation of {:?} failed: {}", layout, err);
                ptr::null_mut()
            }
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with(|kalloc| {
            // SAFETY: `ptr` came from `alloc` above, per the GlobalAlloc contract.
            unsafe { kalloc.kfree(ptr) }
        });
    }
}
