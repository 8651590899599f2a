use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress, VirtualPage};

/// Half-open virtual byte range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        debug_assert!(start.as_u64() <= end.as_u64());
        Self { start, end }
    }

    /// `pages` 4 KiB pages starting at `start`, `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn from_pages(start: VirtualAddress, pages: u64) -> Option<Self> {
        let Some(len) = pages.checked_mul(Size4K::SIZE) else {
            return None;
        };
        match start.checked_add(len) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of 4 KiB pages touched by the range.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.len().div_ceil(Size4K::SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Iterate the 4 KiB pages covering the range.
    pub fn iter_pages(&self) -> impl Iterator<Item = VirtualPage<Size4K>> + use<> {
        let first = self.start.page::<Size4K>();
        (0..self.pages()).map(move |i| first.add(i))
    }
}

/// Half-open physical byte range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysicalRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        debug_assert!(start.as_u64() <= end.as_u64());
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn from_len(start: PhysicalAddress, len: u64) -> Self {
        Self::new(start, PhysicalAddress::new(start.as_u64().saturating_add(len)))
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame indices of every 4 KiB frame lying completely inside the range.
    #[inline]
    #[must_use]
    pub const fn whole_frames(&self) -> core::ops::Range<u64> {
        let first = self.start.as_u64().div_ceil(Size4K::SIZE);
        let last = self.end.as_u64() / Size4K::SIZE;
        if first < last { first..last } else { first..first }
    }

    /// Frame indices of every 4 KiB frame the range touches, even partially.
    #[inline]
    #[must_use]
    pub const fn touched_frames(&self) -> core::ops::Range<u64> {
        let first = self.start.as_u64() / Size4K::SIZE;
        let last = self.end.as_u64().div_ceil(Size4K::SIZE);
        first..last
    }
}
