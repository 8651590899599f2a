//! # Kernel Memory Allocation
//!
//! Physical frames and the kernel heap.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Kernel heap ([`heap`])              │
//! │    • first-fit free list with coalescing            │
//! │    • grows by committing pages through a backing    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ maps eager memory objects
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Kernel address space (kernel-vmem)         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │       Physical frame allocator ([`frame_alloc`])    │
//! │    • one bit per 4 KiB frame plus a reserved bit    │
//! │    • single, contiguous and 2 MiB allocations       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`phys_mapper::HhdmPhysMapper`] reaches physical memory through the
//! higher-half direct map set up by the loader.
//!
//! ## Locking
//!
//! Neither the allocator nor the heap lock themselves. The kernel keeps each
//! behind its own `kernel_sync` mutex and always takes them in the order
//! heap, address space, frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
mod free_list;
pub mod heap;
pub mod phys_mapper;

pub use crate::frame_alloc::{BitmapFrameAlloc, FrameError, FrameStats};
pub use crate::heap::{Heap, HeapBacking, HeapError, HeapStats};
pub use crate::phys_mapper::HhdmPhysMapper;
