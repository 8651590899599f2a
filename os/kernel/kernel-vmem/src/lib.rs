//! # Virtual Memory Support
//!
//! x86-64 page tables, virtual memory objects, regions and address spaces.
//!
//! ## What you get
//! - [`AddressSpace`]: a PML4 root plus an ordered table of [`Region`]s. The
//!   unit that is switched on a context change and the target of page faults.
//! - [`VmObject`]: what backs a region (anonymous memory, device MMIO,
//!   uncacheable memory) and how each page is populated and cached.
//! - [`PageTables`]: the raw walk over PML4 → PDPT → PD → PT with lock-free,
//!   idempotent leaf installation.
//! - The seams to the rest of the kernel: [`FrameAlloc`] for physical frames,
//!   [`PhysMapper`] to reach physical memory, and [`Mmu`] for CR3 loads and
//!   TLB shootdowns.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47..39 | 38..30 | 29..21 | 20..12 | 11..0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! Regions are mapped with 4 KiB leaves unless their object was built with
//! [`PageGranularity::Large`]; those get `PS=1` PDEs over 2 MiB frames and are
//! placed on 2 MiB boundaries. 1 GiB leaves are only ever read (the boot-time
//! HHDM), never created here.
//!
//! ## Kernel half
//!
//! PML4 slots `256..512` cover the kernel half. The kernel address space
//! allocates every one of their PDPTs up front and user address spaces copy
//! those 256 entries, so a kernel mapping created at any later time is
//! visible through every root without touching the user spaces.
//!
//! ## Locking
//!
//! An [`AddressSpace`] is not internally locked; owners wrap it in a
//! `SpinMutex` and take it with interrupts masked. The frame allocator is
//! reached through [`FrameAlloc`], whose impl for `&Mutex<A, _>` locks per
//! call, so the allocator lock is always the innermost one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod entry;
mod error;
pub mod mmu;
pub mod object;
mod page_table;
mod page_tables;
mod permissions;
pub mod region;

pub use crate::address_space::{
    AddressSpace, FatalFault, FaultReason, Placement, Resolved, SpaceKind,
};
pub use crate::entry::PageTableEntry;
pub use crate::error::VmError;
pub use crate::mmu::{Mmu, ShootdownTarget};
pub use crate::object::{Backing, CachePolicy, Commit, PageGranularity, VmObject};
pub use crate::page_table::{PageTable, TableLevel};
pub use crate::page_tables::{DetachedTables, Install, PageTables};
pub use crate::permissions::{AccessKind, FaultAccess, Permissions};
pub use crate::region::{Region, RegionTable};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K};
use kernel_sync::{Mutex, RawLock};

/// Source of physical 4 KiB frames, and optionally of 2 MiB ones.
///
/// Frames handed out are exclusively owned by the caller until passed back
/// to [`free_4k`](Self::free_4k) (or [`free_2m`](Self::free_2m)). Contents
/// are unspecified.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);

    /// A naturally aligned 2 MiB frame. Allocators without large frames
    /// keep the default and never hand one out.
    fn alloc_2m(&mut self) -> Option<PhysicalPage<Size2M>> {
        None
    }

    /// Return a frame previously obtained from [`alloc_2m`](Self::alloc_2m).
    fn free_2m(&mut self, frame: PhysicalPage<Size2M>) {
        let first = PhysicalPage::<Size4K>::containing_address(frame.base());
        for i in 0..Size2M::FRAMES {
            self.free_4k(first.add(i));
        }
    }
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }

    #[inline]
    fn alloc_2m(&mut self) -> Option<PhysicalPage<Size2M>> {
        (**self).alloc_2m()
    }

    #[inline]
    fn free_2m(&mut self, frame: PhysicalPage<Size2M>) {
        (**self).free_2m(frame);
    }
}

/// A shared, locked allocator. The lock is held for a single call only, with
/// interrupts masked, so "address space before frame allocator" is the only
/// nesting that can ever occur.
impl<A: FrameAlloc, R: RawLock> FrameAlloc for &Mutex<A, R> {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.lock_irq().alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.lock_irq().free_4k(frame);
    }

    #[inline]
    fn alloc_2m(&mut self) -> Option<PhysicalPage<Size2M>> {
        self.lock_irq().alloc_2m()
    }

    #[inline]
    fn free_2m(&mut self, frame: PhysicalPage<Size2M>) {
        self.lock_irq().free_2m(frame);
    }
}

/// Access to physical memory from the running kernel (usually via the HHDM).
pub trait PhysMapper {
    /// Kernel-accessible pointer to the byte at `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}

/// Fill a whole frame with zeroes.
///
/// # Safety
/// `frame` must be owned by the caller and reachable through `mapper`.
#[inline]
pub unsafe fn zero_frame<M: PhysMapper + ?Sized>(mapper: &M, frame: PhysicalPage<Size4K>) {
    let ptr = mapper.phys_to_ptr(frame.base());
    unsafe { core::ptr::write_bytes(ptr, 0, 4096) };
}

/// Allocate a 2 MiB frame and zero it.
pub(crate) fn alloc_zeroed_2m<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
    mapper: &M,
    alloc: &mut A,
) -> Result<PhysicalPage<Size2M>, VmError> {
    let frame = alloc.alloc_2m().ok_or(VmError::OutOfMemory)?;
    let ptr = mapper.phys_to_ptr(frame.base());
    // SAFETY: the frame is ours and the mapper covers all of physical memory.
    unsafe { core::ptr::write_bytes(ptr, 0, 1 << Size2M::SHIFT) };
    Ok(frame)
}

/// Allocate a frame and zero it.
pub(crate) fn alloc_zeroed<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
    mapper: &M,
    alloc: &mut A,
) -> Result<PhysicalPage<Size4K>, VmError> {
    let frame = alloc.alloc_4k().ok_or(VmError::OutOfMemory)?;
    unsafe { zero_frame(mapper, frame) };
    Ok(frame)
}
