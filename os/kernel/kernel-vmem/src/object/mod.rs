//! # Virtual Memory Objects
//!
//! A [`VmObject`] answers "which physical frame backs page `n` of this
//! range, and how must it be cached". Where it is mapped and with which
//! permissions is the business of the [`Region`](crate::Region) that owns it.
//!
//! | Variant | Frames | Cache policy | `release` |
//! |---------|--------|--------------|-----------|
//! | [`MemoryBacked`](VmObject::MemoryBacked) | allocated lazily (or eagerly), zeroed | write-back | frees them |
//! | [`Mmio`](VmObject::Mmio) | `base + offset`, never allocated | strong uncacheable | no-op |
//! | [`Uncacheable`](VmObject::Uncacheable) | allocated eagerly, zeroed | uncacheable | frees them |
//!
//! Anonymous objects can be built with [`PageGranularity::Large`]: frames
//! then come from [`FrameAlloc::alloc_2m`] and the region is mapped with
//! 2 MiB leaves. Offsets stay in 4 KiB pages either way.
//!
//! Resolution is deterministic and idempotent: resolving an offset twice
//! yields the same frame until the object is released.

mod anonymous;
mod frame_table;
mod mmio;

pub use anonymous::AnonymousMemory;
pub use frame_table::{FrameTable, MAX_OBJECT_PAGES};
pub use mmio::Mmio;

use crate::entry::PageTableEntry;
use crate::{FrameAlloc, PhysMapper, VmError};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K};

/// Caching attribute installed on every leaf of an object.
///
/// Encoded through `PCD`/`PWT` against the power-on PAT layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    WriteBack,
    /// UC- (`PCD`): uncached, but MTRRs may still upgrade to write-combining.
    Uncacheable,
    /// UC (`PCD|PWT`): uncached and strictly ordered; device registers.
    StrongUncacheable,
}

impl CachePolicy {
    #[must_use]
    pub const fn apply(self, e: PageTableEntry) -> PageTableEntry {
        match self {
            Self::WriteBack => e.with_pcd(false).with_pwt(false),
            Self::Uncacheable => e.with_pcd(true).with_pwt(false),
            Self::StrongUncacheable => e.with_pcd(true).with_pwt(true),
        }
    }
}

/// When the frames of an object are populated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Commit {
    /// On the first fault of each page.
    Lazy,
    /// All at once when the object is mapped.
    Eager,
}

/// Leaf size an object is mapped with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageGranularity {
    /// 4 KiB leaves in a page table.
    Small,
    /// 2 MiB leaves (`PS=1`) in a page directory.
    Large,
}

impl PageGranularity {
    /// 4 KiB pages per leaf.
    #[inline]
    #[must_use]
    pub const fn pages(self) -> u64 {
        match self {
            Self::Small => 1,
            Self::Large => Size2M::FRAMES,
        }
    }

    /// Bytes per leaf, and the alignment regions of this granularity need.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Small => Size4K::SIZE,
            Self::Large => Size2M::SIZE,
        }
    }
}

/// The capability every object variant provides to the address space.
pub trait Backing {
    /// Length in 4 KiB pages. Immutable after construction.
    fn len_pages(&self) -> u64;

    fn cache_policy(&self) -> CachePolicy;

    fn commit(&self) -> Commit;

    fn granularity(&self) -> PageGranularity {
        PageGranularity::Small
    }

    /// The frame backing page `offset`, allocating it if needed.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] if `offset` is beyond the object.
    /// - [`VmError::OutOfMemory`] if a frame was needed and none was available.
    fn resolve<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        offset: u64,
    ) -> Result<PhysicalPage<Size4K>, VmError>;

    /// Give back every frame this object privately allocated.
    ///
    /// The object must no longer be mapped anywhere.
    fn release<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(&mut self, mapper: &M, alloc: &mut A);
}

/// What backs a region.
#[derive(Debug)]
pub enum VmObject {
    /// Anonymous, zero-filled, write-back memory.
    MemoryBacked(AnonymousMemory),
    /// Fixed device registers.
    Mmio(Mmio),
    /// Privately owned memory mapped uncached, for coherent access without
    /// explicit cache maintenance.
    Uncacheable(AnonymousMemory),
}

/// Short name of a variant, for logs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectKind {
    MemoryBacked,
    Mmio,
    Uncacheable,
}

impl VmObject {
    /// Anonymous memory of `pages` pages.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for a zero or oversized length.
    pub fn memory_backed(pages: u64, commit: Commit) -> Result<Self, VmError> {
        AnonymousMemory::new(pages, commit, CachePolicy::WriteBack, PageGranularity::Small)
            .map(Self::MemoryBacked)
    }

    /// Anonymous memory of `pages` pages backed by 2 MiB frames.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for a zero or oversized length, or one
    /// that is not a multiple of 512 pages.
    pub fn memory_backed_large(pages: u64, commit: Commit) -> Result<Self, VmError> {
        AnonymousMemory::new(pages, commit, CachePolicy::WriteBack, PageGranularity::Large)
            .map(Self::MemoryBacked)
    }

    /// Device registers at `base`, `pages` pages long.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for a zero length, a misaligned base or
    /// a range that wraps the physical address space.
    pub fn mmio(base: PhysicalAddress, pages: u64) -> Result<Self, VmError> {
        Mmio::new(base, pages).map(Self::Mmio)
    }

    /// Uncached private memory, populated when mapped.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for a zero or oversized length, or a
    /// [`Large`](PageGranularity::Large) one that is not a multiple of 512
    /// pages.
    pub fn uncacheable(pages: u64, granularity: PageGranularity) -> Result<Self, VmError> {
        AnonymousMemory::new(pages, Commit::Eager, CachePolicy::Uncacheable, granularity)
            .map(Self::Uncacheable)
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::MemoryBacked(_) => ObjectKind::MemoryBacked,
            Self::Mmio(_) => ObjectKind::Mmio,
            Self::Uncacheable(_) => ObjectKind::Uncacheable,
        }
    }

    /// Physical address of page `offset` if it has already been resolved.
    ///
    /// Lets a driver hand an uncacheable buffer to a device.
    pub fn physical_address<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        offset: u64,
    ) -> Option<PhysicalAddress> {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.lookup(mapper, offset),
            Self::Mmio(m) => m.frame(offset),
        }
        .map(PhysicalPage::base)
    }
}

impl Backing for VmObject {
    fn len_pages(&self) -> u64 {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.len_pages(),
            Self::Mmio(m) => m.len_pages(),
        }
    }

    fn cache_policy(&self) -> CachePolicy {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.cache_policy(),
            Self::Mmio(m) => m.cache_policy(),
        }
    }

    fn commit(&self) -> Commit {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.commit(),
            Self::Mmio(m) => m.commit(),
        }
    }

    fn granularity(&self) -> PageGranularity {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.granularity(),
            Self::Mmio(m) => m.granularity(),
        }
    }

    fn resolve<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        offset: u64,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.resolve(mapper, alloc, offset),
            Self::Mmio(m) => m.resolve(mapper, alloc, offset),
        }
    }

    fn release<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(&mut self, mapper: &M, alloc: &mut A) {
        match self {
            Self::MemoryBacked(m) | Self::Uncacheable(m) => m.release(mapper, alloc),
            Self::Mmio(m) => m.release(mapper, alloc),
        }
    }
}
