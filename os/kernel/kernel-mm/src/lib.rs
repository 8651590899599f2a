//! # Kernel Memory Management
//!
//! The boot-time singletons that tie the memory crates together:
//!
//! ```text
//!   FRAMES        TicketMutex<BitmapFrameAlloc>
//!   KERNEL_SPACE  SpinMutex<AddressSpace>      ── kernel half, shared by all roots
//!   HEAP          SpinMutex<Heap>              ── grows through KERNEL_SPACE
//!   MMU           &'static dyn Mmu
//! ```
//!
//! [`init`] builds them once, in that order, from the boot memory map. After
//! that the kernel uses the free functions of this crate, [`UserSpace`] for
//! per-task address spaces and [`fault::handle_page_fault`] from the #PF
//! handler.
//!
//! ## Locking
//!
//! Every lock is taken with interrupts masked. The order is heap, address
//! space, frame allocator; the frame allocator is only ever locked for a
//! single call.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod allocator;
pub mod fault;
mod heap_backing;
mod layout;
mod user;

pub use crate::allocator::KernelAllocator;
pub use crate::fault::{FaultOutcome, PageFaultErrorCode, handle_page_fault};
pub use crate::heap_backing::{HeapBackend, KernelHeapBacking};
pub use crate::layout::{HeapSource, KernelLayout};
pub use crate::user::UserSpace;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_alloc::{
    BitmapFrameAlloc, FrameError, FrameStats, Heap, HeapError, HeapStats, HhdmPhysMapper,
};
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{KERNEL_HEAP_GROWTH, KERNEL_HEAP_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{SpinMutex, SyncOnceCell, TicketMutex};
use kernel_vmem::{
    AddressSpace, FatalFault, FaultAccess, FaultReason, Mmu, Permissions, Placement, Resolved,
    VmError, VmObject,
};

/// Region capacity of the kernel address space.
///
/// Half of it is set aside for the heap, which adds one region per growth.
pub const KERNEL_MAX_REGIONS: usize = 1024;

/// Most regions an on-demand heap may need.
const HEAP_REGION_BUDGET: u64 = (KERNEL_MAX_REGIONS / 2) as u64;

const _: () = assert!(KERNEL_HEAP_SIZE.div_ceil(KERNEL_HEAP_GROWTH) <= HEAP_REGION_BUDGET);

/// The kernel address space type.
pub type KernelSpace = AddressSpace<HhdmPhysMapper, KERNEL_MAX_REGIONS>;

static STARTED: AtomicBool = AtomicBool::new(false);
static LAYOUT: SyncOnceCell<KernelLayout> = SyncOnceCell::new();
static MMU: SyncOnceCell<&'static dyn Mmu> = SyncOnceCell::new();
static FRAMES: SyncOnceCell<TicketMutex<BitmapFrameAlloc>> = SyncOnceCell::new();
static KERNEL_SPACE: SyncOnceCell<SpinMutex<KernelSpace>> = SyncOnceCell::new();
static HEAP: SyncOnceCell<SpinMutex<Heap<HeapBackend>>> = SyncOnceCell::new();

/// What the platform code knows about physical memory at boot.
#[derive(Debug, Copy, Clone)]
pub struct BootMemory<'a> {
    pub map: &'a [MemoryMapEntry],
    /// Virtual address at which physical address zero is mapped.
    pub hhdm_offset: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("memory management is already initialized")]
    AlreadyInitialized,
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameError),
    #[error("kernel address space: {0}")]
    Vm(#[from] VmError),
}

/// Bring up memory management: frame allocator, kernel address space, heap.
///
/// Runs at most once; later calls fail with
/// [`InitError::AlreadyInitialized`], as does every call after a failed one.
///
/// # Safety
/// - `boot.map` must describe physical memory truthfully and every usable
///   range must be unused.
/// - `boot.hhdm_offset` must map all of physical memory for the lifetime of
///   the kernel.
/// - `layout.adopt_root`, if given, must be a live PML4 that is never freed.
/// - A [`HeapSource::Premapped`] range must be mapped, writable memory that
///   nothing else uses.
///
/// # Errors
/// - [`InitError::Frames`] if there is no room for the frame bitmaps.
/// - [`InitError::Vm`] if the kernel root or the kernel-half tables cannot be
///   allocated, a window or the heap range is malformed, or an on-demand
///   heap would need more regions than its share of [`KERNEL_MAX_REGIONS`].
pub unsafe fn init(boot: BootMemory<'_>, layout: KernelLayout, mmu: &'static dyn Mmu) -> Result<(), InitError> {
    if STARTED.swap(true, Ordering::AcqRel) {
        return Err(InitError::AlreadyInitialized);
    }
    check_heap_range(&layout)?;
    let layout = LAYOUT.set(layout).map_err(|_| InitError::AlreadyInitialized)?;
    MMU.set(mmu).map_err(|_| InitError::AlreadyInitialized)?;

    let mapper = HhdmPhysMapper::with_offset(boot.hhdm_offset);
    log::info!("physical memory map ({} entries):", boot.map.len());
    let allocator = unsafe { BitmapFrameAlloc::from_memory_map(&mapper, boot.map)? };
    let frames = FRAMES
        .set(TicketMutex::new(allocator))
        .map_err(|_| InitError::AlreadyInitialized)?;

    let mut alloc = frames;
    let space = match layout.adopt_root {
        Some(root) => unsafe { AddressSpace::adopt_kernel(mapper, root, layout.kernel_window, &mut alloc)? },
        None => AddressSpace::new_kernel(mapper, layout.kernel_window, &mut alloc)?,
    };
    let space = KERNEL_SPACE
        .set(SpinMutex::new(space))
        .map_err(|_| InitError::AlreadyInitialized)?;

    let backend = match layout.heap {
        HeapSource::OnDemand(reserve) => HeapBackend::Kernel(KernelHeapBacking::new(space, frames, reserve)),
        HeapSource::Premapped(range) => HeapBackend::Premapped(range),
    };
    HEAP.set(SpinMutex::new(Heap::new(backend, layout.heap_growth)))
        .map_err(|_| InitError::AlreadyInitialized)?;

    log::info!(
        "memory management ready: kernel root {:?}, heap {:?}..{:?}, {}",
        space.lock_irq().root(),
        layout.heap.range().start,
        layout.heap.range().end,
        frames.lock_irq().stats()
    );
    Ok(())
}

fn check_heap_range(layout: &KernelLayout) -> Result<(), VmError> {
    let range = layout.heap.range();
    let aligned = range.start.as_u64() % 4096 == 0 && range.end.as_u64() % 4096 == 0;
    if !aligned || range.is_empty() {
        return Err(VmError::InvalidArgument("heap range must be a non-empty page-aligned range"));
    }
    if let HeapSource::OnDemand(_) = layout.heap {
        if range.overlaps(&layout.kernel_window) {
            return Err(VmError::InvalidArgument("heap reserve overlaps the kernel window"));
        }
        if range.len().div_ceil(layout.heap_growth.max(PAGE_SIZE)) > HEAP_REGION_BUDGET {
            return Err(VmError::InvalidArgument(
                "heap growth too small for its reserve; the kernel region table would fill",
            ));
        }
    }
    Ok(())
}

#[must_use]
pub fn is_initialized() -> bool {
    HEAP.is_initialized()
}

pub(crate) fn layout() -> KernelLayout {
    LAYOUT.get().copied().unwrap_or_default()
}

pub(crate) fn mmu() -> Option<&'static dyn Mmu> {
    MMU.get().copied()
}

/// The frame allocator. Lock it last, and only for a single call.
#[must_use]
pub fn frames() -> Option<&'static TicketMutex<BitmapFrameAlloc>> {
    FRAMES.get()
}

/// The kernel address space. Never lock it while holding the frame
/// allocator.
#[must_use]
pub fn kernel_space() -> Option<&'static SpinMutex<KernelSpace>> {
    KERNEL_SPACE.get()
}

pub(crate) const fn not_initialized() -> VmError {
    VmError::InvalidArgument("memory management is not initialized")
}

/// Allocate `size` bytes from the kernel heap.
///
/// # Errors
/// See [`Heap::allocate`]; [`HeapError::OutOfMemory`] before [`init`].
pub fn allocate(size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
    let heap = HEAP.get().ok_or(HeapError::OutOfMemory)?;
    heap.lock_irq().allocate(size, align)
}

/// Return a heap allocation.
///
/// # Errors
/// [`HeapError::InvalidFree`] if `ptr` is not a live heap allocation.
///
/// # Safety
/// `ptr` must not be used after it was freed.
pub unsafe fn free(ptr: *mut u8) -> Result<(), HeapError> {
    let heap = HEAP.get().ok_or(HeapError::InvalidFree)?;
    let result = unsafe { heap.lock_irq().free(ptr) };
    if let Err(e) = result {
        log::warn!("heap free of {ptr:p} rejected: {e}");
    }
    result
}

#[must_use]
pub fn heap_stats() -> Option<HeapStats> {
    HEAP.get().map(|h| h.lock_irq().stats())
}

/// Map `pages` pages of `object` into the kernel address space.
///
/// # Errors
/// As [`AddressSpace::map`].
pub fn map_kernel(
    placement: Placement,
    pages: u64,
    perms: Permissions,
    object: VmObject,
) -> Result<VirtualAddress, VmError> {
    let (space, mut frames) = kernel_space().zip(frames()).ok_or_else(not_initialized)?;
    space.lock_irq().map(placement, pages, perms, object, &mut frames)
}

/// Remove the kernel region starting at `base`; every CPU drops its
/// cached translations before the frames are freed.
///
/// # Errors
/// As [`AddressSpace::unmap`].
pub fn unmap_kernel(base: VirtualAddress) -> Result<(), VmError> {
    let (space, mut frames) = kernel_space().zip(frames()).ok_or_else(not_initialized)?;
    let mmu = mmu().ok_or_else(not_initialized)?;
    space.lock_irq().unmap(base, &mut frames, mmu)
}

/// Translate a kernel virtual address through the kernel page tables.
#[must_use]
pub fn translate_kernel(va: VirtualAddress) -> Option<kernel_memory_addresses::PhysicalAddress> {
    kernel_space()?.lock_irq().translate(va)
}

/// Load the kernel root on the calling CPU.
pub fn switch_to_kernel() {
    if let Some((space, mmu)) = kernel_space().zip(mmu()) {
        space.lock_irq().switch_to(mmu);
    }
}

pub(crate) fn resolve_kernel_fault(address: VirtualAddress, access: FaultAccess) -> Result<Resolved, FatalFault> {
    let Some((space, mut frames)) = kernel_space().zip(frames()) else {
        return Err(FatalFault {
            address,
            access,
            reason: FaultReason::NoRegion,
        });
    };
    space.lock_irq().handle_page_fault(address, access, &mut frames)
}

/// Allocate one physical frame.
///
/// # Errors
/// [`FrameError::OutOfMemory`] if none is free (or before [`init`]).
pub fn allocate_frame() -> Result<PhysicalPage<Size4K>, FrameError> {
    frames().ok_or(FrameError::OutOfMemory)?.lock_irq().allocate()
}

/// Allocate `count` physically contiguous frames, e.g. for DMA.
///
/// # Errors
/// [`FrameError::OutOfMemory`] if no such run is free.
pub fn allocate_contiguous(count: u64) -> Result<PhysicalPage<Size4K>, FrameError> {
    frames().ok_or(FrameError::OutOfMemory)?.lock_irq().allocate_contiguous(count)
}

/// # Errors
/// See [`BitmapFrameAlloc::free`].
pub fn free_frame(frame: PhysicalPage<Size4K>) -> Result<(), FrameError> {
    frames().ok_or(FrameError::Unmanaged)?.lock_irq().free(frame)
}

/// # Errors
/// See [`BitmapFrameAlloc::free_contiguous`].
pub fn free_contiguous(first: PhysicalPage<Size4K>, count: u64) -> Result<(), FrameError> {
    frames()
        .ok_or(FrameError::Unmanaged)?
        .lock_irq()
        .free_contiguous(first, count)
}

#[must_use]
pub fn frame_stats() -> Option<FrameStats> {
    frames().map(|f| f.lock_irq().stats())
}
