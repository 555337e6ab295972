//! Memory management module for kheap
//!
//! Provides:
//! - Address types and page rounding
//! - Page tables, a physical frame allocator and a page mapper
//! - The kernel heap with its hole index and block metadata
//! - `kmalloc`-style entry points and a locked global allocator
//!
//! # Security Principles
//! - Heap metadata is checked on every free; corruption stops the kernel
//! - Every mapping carries explicit protection flags
//! - Unsafe code is confined to in-place metadata access

pub mod address;
pub mod allocator;
pub mod block;
pub mod frame;
pub mod heap;
pub mod kmalloc;
pub mod mapper;
pub mod ordered;
pub mod paging;

#[cfg(test)]
mod testing;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use allocator::LockedKernelAllocator;
pub use heap::{Heap, HeapConfig, HeapError, HeapStats};
pub use kmalloc::KernelAllocator;
pub use mapper::{AddressSpace, PageMapper, PageWindow};
