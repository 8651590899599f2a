use super::{Backing, CachePolicy, Commit, FrameTable, MAX_OBJECT_PAGES, PageGranularity};
use crate::{FrameAlloc, PhysMapper, VmError, alloc_zeroed, alloc_zeroed_2m};
use kernel_memory_addresses::{PhysicalPage, Size2M, Size4K};

/// Zero-filled memory owned by a single object.
///
/// Frames are allocated on first resolve (or all at once when mapped, for
/// [`Commit::Eager`]) and remembered in a [`FrameTable`] so that every later
/// resolve of the same offset returns the same frame. A
/// [`Large`](PageGranularity::Large) object keeps one slot per 2 MiB frame.
#[derive(Debug)]
pub struct AnonymousMemory {
    pages: u64,
    commit: Commit,
    cache: CachePolicy,
    granularity: PageGranularity,
    frames: FrameTable,
}

impl AnonymousMemory {
    /// # Errors
    /// [`VmError::InvalidArgument`] for zero pages, more than
    /// [`MAX_OBJECT_PAGES`], or a large object whose length is not a whole
    /// number of 2 MiB pages.
    pub const fn new(
        pages: u64,
        commit: Commit,
        cache: CachePolicy,
        granularity: PageGranularity,
    ) -> Result<Self, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument("object length must be non-zero"));
        }
        if pages > MAX_OBJECT_PAGES {
            return Err(VmError::InvalidArgument("object too large"));
        }
        if !pages.is_multiple_of(granularity.pages()) {
            return Err(VmError::InvalidArgument("large object length must be a multiple of 2 MiB"));
        }
        Ok(Self {
            pages,
            commit,
            cache,
            granularity,
            frames: FrameTable::new(pages / granularity.pages()),
        })
    }

    /// The frame already backing `offset`, without allocating.
    pub fn lookup<M: PhysMapper + ?Sized>(&self, mapper: &M, offset: u64) -> Option<PhysicalPage<Size4K>> {
        if offset >= self.pages {
            return None;
        }
        let step = self.granularity.pages();
        self.frames
            .get(mapper, offset / step)
            .map(|first| first.add(offset % step))
    }

    /// Number of pages that currently have a frame.
    #[must_use]
    pub const fn resident_pages(&self) -> u64 {
        self.frames.populated() * self.granularity.pages()
    }

    fn allocate<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &self,
        mapper: &M,
        alloc: &mut A,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        match self.granularity {
            PageGranularity::Small => alloc_zeroed(mapper, alloc),
            PageGranularity::Large => alloc_zeroed_2m(mapper, alloc)
                .map(|frame| PhysicalPage::containing_address(frame.base())),
        }
    }

    fn free<A: FrameAlloc + ?Sized>(granularity: PageGranularity, alloc: &mut A, frame: PhysicalPage<Size4K>) {
        match granularity {
            PageGranularity::Small => alloc.free_4k(frame),
            PageGranularity::Large => alloc.free_2m(PhysicalPage::<Size2M>::containing_address(frame.base())),
        }
    }
}

impl Backing for AnonymousMemory {
    #[inline]
    fn len_pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    #[inline]
    fn commit(&self) -> Commit {
        self.commit
    }

    #[inline]
    fn granularity(&self) -> PageGranularity {
        self.granularity
    }

    fn resolve<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        offset: u64,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        if offset >= self.pages {
            return Err(VmError::InvalidArgument("offset beyond object"));
        }
        if let Some(frame) = self.lookup(mapper, offset) {
            return Ok(frame);
        }

        let step = self.granularity.pages();
        let first = self.allocate(mapper, alloc)?;
        if let Err(e) = self.frames.insert(mapper, alloc, offset / step, first) {
            Self::free(self.granularity, alloc, first);
            return Err(e);
        }
        Ok(first.add(offset % step))
    }

    fn release<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(&mut self, mapper: &M, alloc: &mut A) {
        let granularity = self.granularity;
        let freed = self
            .frames
            .drain_with(mapper, alloc, |alloc, frame| Self::free(granularity, alloc, frame));
        log::trace!(
            "released {freed} {granularity:?} frames of a {}-page object",
            self.pages
        );
    }
}

impl Drop for AnonymousMemory {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            log::warn!(
                "anonymous object of {} pages dropped without release; {} pages leaked",
                self.pages,
                self.resident_pages()
            );
        }
    }
}
