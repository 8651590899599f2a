//! Where heap chunks come from.

use crate::KernelSpace;
use kernel_alloc::{BitmapFrameAlloc, HeapBacking, HeapError};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_sync::{SpinMutex, TicketMutex};
use kernel_vmem::{Commit, Permissions, Placement, VmObject};

/// Commits heap chunks as eager memory regions of the kernel address space.
///
/// Every commit is its own region; [`KERNEL_MAX_REGIONS`](crate::KERNEL_MAX_REGIONS)
/// leaves room for a reserve grown one granule at a time.
///
/// Called with the heap lock held; takes the address-space lock, which in
/// turn takes the frame-allocator lock per frame.
pub struct KernelHeapBacking {
    space: &'static SpinMutex<KernelSpace>,
    frames: &'static TicketMutex<BitmapFrameAlloc>,
    reserve: VirtualRange,
}

impl KernelHeapBacking {
    #[must_use]
    pub const fn new(
        space: &'static SpinMutex<KernelSpace>,
        frames: &'static TicketMutex<BitmapFrameAlloc>,
        reserve: VirtualRange,
    ) -> Self {
        Self {
            space,
            frames,
            reserve,
        }
    }
}

impl HeapBacking for KernelHeapBacking {
    fn reserved(&self) -> VirtualRange {
        self.reserve
    }

    fn commit(&mut self, at: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
        let pages = bytes / PAGE_SIZE;
        let object = VmObject::memory_backed(pages, Commit::Eager)?;
        let mut frames = self.frames;
        let base = self.space.lock_irq().map(
            Placement::Fixed(at),
            pages,
            Permissions::RW,
            object,
            &mut frames,
        )?;
        debug_assert_eq!(base, at);
        Ok(())
    }
}

/// The backing of the global heap.
pub enum HeapBackend {
    Kernel(KernelHeapBacking),
    Premapped(VirtualRange),
}

impl HeapBacking for HeapBackend {
    fn reserved(&self) -> VirtualRange {
        match self {
            Self::Kernel(k) => k.reserved(),
            Self::Premapped(r) => *r,
        }
    }

    fn commit(&mut self, at: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
        match self {
            Self::Kernel(k) => k.commit(at, bytes),
            Self::Premapped(_) => Ok(()),
        }
    }
}
