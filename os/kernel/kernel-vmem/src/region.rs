//! # Regions
//!
//! A [`Region`] is a page-aligned virtual range with permissions and the
//! [`VmObject`] that backs it. A [`RegionTable`] keeps the regions of one
//! address space sorted by base address so fault lookup is a binary search.
//!
//! The table has fixed capacity and lives inside the address space, which
//! lets the kernel address space exist before (and underneath) the heap.
//! The capacity is a const parameter: user spaces use [`MAX_REGIONS`], the
//! kernel space picks a larger one because every heap growth adds a region.

use crate::object::{Backing, VmObject};
use crate::{Permissions, VmError};
use kernel_memory_addresses::{VirtualAddress, VirtualRange, align_up};

/// Default regions per address space.
pub const MAX_REGIONS: usize = 512;

/// One mapped range of an address space.
#[derive(Debug)]
pub struct Region {
    base: VirtualAddress,
    pages: u64,
    perms: Permissions,
    object: VmObject,
}

impl Region {
    /// # Errors
    /// [`VmError::InvalidArgument`] if `base` is misaligned, `pages` is zero,
    /// longer than `object`, or the range wraps.
    pub fn new(
        base: VirtualAddress,
        pages: u64,
        perms: Permissions,
        object: VmObject,
    ) -> Result<Self, (VmError, VmObject)> {
        if !base.is_aligned::<kernel_memory_addresses::Size4K>() {
            return Err((VmError::InvalidArgument("region base must be page aligned"), object));
        }
        if pages == 0 {
            return Err((VmError::InvalidArgument("region length must be non-zero"), object));
        }
        if pages > object.len_pages() {
            return Err((VmError::InvalidArgument("region longer than its object"), object));
        }
        if VirtualRange::from_pages(base, pages).is_none() {
            return Err((VmError::InvalidArgument("region wraps the address space"), object));
        }
        Ok(Self {
            base,
            pages,
            perms,
            object,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn permissions(&self) -> Permissions {
        self.perms
    }

    #[inline]
    #[must_use]
    pub const fn object(&self) -> &VmObject {
        &self.object
    }

    #[inline]
    pub const fn object_mut(&mut self) -> &mut VmObject {
        &mut self.object
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        VirtualRange::new(
            self.base,
            VirtualAddress::new(self.base.as_u64() + self.pages * 4096),
        )
    }

    /// Page offset of `va` into the backing object.
    #[inline]
    #[must_use]
    pub const fn offset_of(&self, va: VirtualAddress) -> u64 {
        (va.as_u64() - self.base.as_u64()) >> 12
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.range().contains(va)
    }

    pub(crate) fn into_object(self) -> VmObject {
        self.object
    }
}

/// Sorted, non-overlapping regions of one address space, at most `N`.
pub struct RegionTable<const N: usize = MAX_REGIONS> {
    slots: [Option<Region>; N],
    len: usize,
}

impl<const N: usize> Default for RegionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegionTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Regions in ascending base order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.slots[..self.len].iter().flatten()
    }

    #[inline]
    fn base_at(&self, index: usize) -> VirtualAddress {
        self.slots[index]
            .as_ref()
            .map_or(VirtualAddress::new(u64::MAX), Region::base)
    }

    /// Index of the first region whose base is above `va`.
    fn upper_bound(&self, va: VirtualAddress) -> usize {
        self.slots[..self.len].partition_point(|r| r.as_ref().is_some_and(|r| r.base() <= va))
    }

    /// Index of the region containing `va`.
    pub fn find_containing(&self, va: VirtualAddress) -> Option<usize> {
        let i = self.upper_bound(va).checked_sub(1)?;
        self.slots[i].as_ref().filter(|r| r.contains(va)).map(|_| i)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Region> {
        self.slots[..self.len].get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Region> {
        self.slots[..self.len].get_mut(index)?.as_mut()
    }

    /// Index of the region starting exactly at `base`.
    #[must_use]
    pub fn index_of_base(&self, base: VirtualAddress) -> Option<usize> {
        let i = self.upper_bound(base).checked_sub(1)?;
        (self.base_at(i) == base).then_some(i)
    }

    /// Whether no region overlaps `range`.
    #[must_use]
    pub fn is_free(&self, range: &VirtualRange) -> bool {
        // Only the last region starting below `range.end` can overlap.
        let Some(end) = range.end.as_u64().checked_sub(1) else {
            return true;
        };
        let i = self.upper_bound(VirtualAddress::new(end));
        match i.checked_sub(1).and_then(|i| self.slots[i].as_ref()) {
            Some(r) => !r.range().overlaps(range),
            None => true,
        }
    }

    /// Lowest `align`-aligned base `>= start` inside `window` where `pages`
    /// pages fit between existing regions. `align` is a power of two of at
    /// least 4 KiB.
    #[must_use]
    pub fn find_free(
        &self,
        window: &VirtualRange,
        pages: u64,
        start: VirtualAddress,
        align: u64,
    ) -> Option<VirtualAddress> {
        debug_assert!(align.is_power_of_two() && align >= 4096);
        let len = pages.checked_mul(4096)?;
        let mut candidate = align_up(start.max(window.start).as_u64(), align)?;
        for r in self.iter() {
            let range = r.range();
            if range.end.as_u64() <= candidate {
                continue;
            }
            if candidate.checked_add(len)? <= range.start.as_u64() {
                break;
            }
            candidate = align_up(range.end.as_u64(), align)?;
        }
        let end = candidate.checked_add(len)?;
        (end <= window.end.as_u64()).then_some(VirtualAddress::new(candidate))
    }

    /// Insert `region` in order.
    ///
    /// # Errors
    /// [`VmError::RangeUnavailable`] if it overlaps an existing region or
    /// the table is full.
    ///
    /// The region is handed back on error.
    pub fn insert(&mut self, region: Region) -> Result<usize, (VmError, Region)> {
        if !self.is_free(&region.range()) {
            return Err((VmError::RangeUnavailable, region));
        }
        if self.len == N {
            return Err((VmError::RangeUnavailable, region));
        }
        let index = self.upper_bound(region.base());
        self.slots[index..=self.len].rotate_right(1);
        self.slots[index] = Some(region);
        self.len += 1;
        Ok(index)
    }

    /// Remove and return the region at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Region> {
        if index >= self.len {
            return None;
        }
        let region = self.slots[index].take();
        self.slots[index..self.len].rotate_left(1);
        self.len -= 1;
        region
    }
}
