use super::{Backing, CachePolicy, Commit};
use crate::{FrameAlloc, PhysMapper, VmError};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A fixed window of device registers.
///
/// Page `n` is always `base + n * 4096`; nothing is allocated or freed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mmio {
    base: PhysicalPage<Size4K>,
    pages: u64,
}

impl Mmio {
    /// # Errors
    /// [`VmError::InvalidArgument`] if `base` is not page aligned, `pages`
    /// is zero or the window wraps the physical address space.
    pub const fn new(base: PhysicalAddress, pages: u64) -> Result<Self, VmError> {
        let Some(base) = PhysicalPage::from_base(base) else {
            return Err(VmError::InvalidArgument("MMIO base must be page aligned"));
        };
        if pages == 0 {
            return Err(VmError::InvalidArgument("object length must be non-zero"));
        }
        let Some(bytes) = pages.checked_mul(4096) else {
            return Err(VmError::InvalidArgument("MMIO window too large"));
        };
        if base.base().checked_add(bytes).is_none() {
            return Err(VmError::InvalidArgument("MMIO window wraps"));
        }
        Ok(Self { base, pages })
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base.base()
    }

    /// The frame of page `offset`, if inside the window.
    #[must_use]
    pub const fn frame(&self, offset: u64) -> Option<PhysicalPage<Size4K>> {
        if offset < self.pages {
            Some(self.base.add(offset))
        } else {
            None
        }
    }
}

impl Backing for Mmio {
    #[inline]
    fn len_pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::StrongUncacheable
    }

    #[inline]
    fn commit(&self) -> Commit {
        Commit::Lazy
    }

    fn resolve<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        _mapper: &M,
        _alloc: &mut A,
        offset: u64,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        self.frame(offset)
            .ok_or(VmError::InvalidArgument("offset beyond object"))
    }

    fn release<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(&mut self, _mapper: &M, _alloc: &mut A) {}
}
