//! kheap - Kernel Heap for PantherOS
//!
//! Dynamic memory for a bare-metal kernel: a contiguous virtual range carved
//! into variable-sized blocks, with freed blocks coalesced and the range
//! grown or shrunk one page at a time through the paging layer.
//!
//! # Boot Sequence
//! 1. [`mm::KernelAllocator::init_placement`]: bump allocation past the kernel
//! 2. Paging is set up using placement memory
//! 3. [`mm::KernelAllocator::create_heap`]: every later request uses the heap
//!
//! # Security Features
//! - Sentinel-framed blocks with back-pointers, checked on every free
//! - Double free and foreign pointers are detected
//! - Heap pages mapped with explicit privilege and write protection

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod mm;

pub use mm::{KernelAllocator, LockedKernelAllocator};
