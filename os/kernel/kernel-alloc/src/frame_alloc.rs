//! # Physical Frame Allocator
//!
//! A bitmap over every 4 KiB frame up to the end of the highest usable range.
//! Two bits per frame:
//!
//! | `used` | `reserved` | state |
//! |--------|------------|-------|
//! | 0 | 0 | free |
//! | 1 | 0 | allocated |
//! | 1 | 1 | reserved, never handed out or freed |
//!
//! Single-frame allocation resumes scanning at a hint that points at the
//! most recently freed frame (or just past the last allocation), so the
//! common case touches one word. The allocator never uses the heap; its
//! bitmaps are either handed in or carved out of usable memory at boot.

use core::fmt;
use kernel_info::boot::{MemoryMapEntry, usable_end};
use kernel_info::memory::{LOW_MEMORY_END, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size2M, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};

const BITS: u64 = u64::BITS as u64;

/// First frame that may ever be handed out.
const FIRST_FRAME: u64 = LOW_MEMORY_END / PAGE_SIZE;

/// Frames per 2 MiB page.
const LARGE_FRAMES: u64 = 512;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// No free frame, or no free run of the requested length.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The frame is free already or reserved.
    #[error("frame was not allocated")]
    NotAllocated,
    /// The frame lies outside the tracked range.
    #[error("frame is not managed by this allocator")]
    Unmanaged,
}

/// Frame counts, see [`BitmapFrameAlloc::stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames covered by the bitmap.
    pub total: u64,
    pub free: u64,
    /// Frames that can never be allocated.
    pub reserved: u64,
}

impl FrameStats {
    #[must_use]
    pub const fn allocated(&self) -> u64 {
        self.total - self.free - self.reserved
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames: {} free ({} MiB), {} allocated, {} reserved",
            self.total,
            self.free,
            self.free * PAGE_SIZE / (1024 * 1024),
            self.allocated(),
            self.reserved
        )
    }
}

/// Bitmap physical frame allocator.
pub struct BitmapFrameAlloc {
    used: &'static mut [u64],
    reserved: &'static mut [u64],
    frames: u64,
    hint: u64,
    free: u64,
    reserved_count: u64,
}

impl BitmapFrameAlloc {
    /// Number of `u64` words each bitmap needs for `map`.
    #[must_use]
    pub fn bitmap_words(map: &[MemoryMapEntry]) -> usize {
        (usable_end(map) / PAGE_SIZE).div_ceil(BITS) as usize
    }

    /// Build the allocator over caller-provided bitmaps.
    ///
    /// Frames beyond `used.len() * 64` are not tracked. Only whole frames
    /// of `Usable` entries at or above 1 MiB become free.
    #[must_use]
    pub fn with_storage(
        used: &'static mut [u64],
        reserved: &'static mut [u64],
        map: &[MemoryMapEntry],
    ) -> Self {
        let words = used.len().min(reserved.len());
        let frames = (usable_end(map) / PAGE_SIZE).min(words as u64 * BITS);
        used.fill(u64::MAX);
        reserved.fill(u64::MAX);

        let mut this = Self {
            used,
            reserved,
            frames,
            hint: FIRST_FRAME,
            free: 0,
            reserved_count: frames,
        };

        for entry in map {
            log::info!(
                "  {:#014x}..{:#014x} {}",
                entry.base,
                entry.end(),
                entry.kind.as_str()
            );
            if !entry.kind.is_usable() {
                continue;
            }
            let whole = entry.range().whole_frames();
            for idx in whole.start.max(FIRST_FRAME)..whole.end.min(frames) {
                if this.is_set(Bitmap::Reserved, idx) {
                    this.clear_bit(Bitmap::Reserved, idx);
                    this.clear_bit(Bitmap::Used, idx);
                    this.free += 1;
                    this.reserved_count -= 1;
                }
            }
        }
        log::info!("frame allocator: {}", this.stats());
        this
    }

    /// Build the allocator, placing its own bitmaps in the first usable
    /// range that can hold them. Those frames are reserved.
    ///
    /// # Safety
    /// `map` must describe physical memory truthfully, usable ranges must be
    /// unused, and `mapper` must reach them for the rest of the kernel's life.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if no usable range is large enough.
    pub unsafe fn from_memory_map<M: PhysMapper + ?Sized>(
        mapper: &M,
        map: &[MemoryMapEntry],
    ) -> Result<Self, FrameError> {
        let words = Self::bitmap_words(map);
        let pages = (2 * words as u64 * 8).div_ceil(PAGE_SIZE).max(1);

        let first = map
            .iter()
            .filter(|e| e.kind.is_usable())
            .map(|e| {
                let whole = e.range().whole_frames();
                whole.start.max(FIRST_FRAME)..whole.end
            })
            .find(|r| r.end.saturating_sub(r.start) >= pages)
            .map(|r| r.start)
            .ok_or(FrameError::OutOfMemory)?;

        let base = PhysicalAddress::new(first * PAGE_SIZE);
        let ptr = mapper.phys_to_ptr(base).cast::<u64>();
        // SAFETY: the frames are usable, unused and reachable per the caller;
        // they are reserved below so nothing else will ever own them.
        let (used, reserved) = unsafe {
            (
                core::slice::from_raw_parts_mut(ptr, words),
                core::slice::from_raw_parts_mut(ptr.add(words), words),
            )
        };

        let mut this = Self::with_storage(used, reserved, map);
        this.reserve(PhysicalRange::from_len(base, pages * PAGE_SIZE));
        log::info!("frame bitmaps at {base:?} ({pages} frames)");
        Ok(this)
    }

    /// Remove every frame `range` touches from the free set for good.
    ///
    /// Returns the number of frames that were free before.
    pub fn reserve(&mut self, range: PhysicalRange) -> u64 {
        let frames = range.touched_frames();
        let mut taken = 0;
        for idx in frames.start..frames.end.min(self.frames) {
            if self.is_set(Bitmap::Reserved, idx) {
                continue;
            }
            if !self.is_set(Bitmap::Used, idx) {
                self.set_bit(Bitmap::Used, idx);
                self.free -= 1;
                taken += 1;
            }
            self.set_bit(Bitmap::Reserved, idx);
            self.reserved_count += 1;
        }
        taken
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.frames,
            free: self.free,
            reserved: self.reserved_count,
        }
    }

    /// Whether `frame` is currently free.
    #[must_use]
    pub fn is_free(&self, frame: PhysicalPage<Size4K>) -> bool {
        let idx = frame.frame_index();
        idx < self.frames && !self.is_set(Bitmap::Used, idx)
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if every frame is taken.
    pub fn allocate(&mut self) -> Result<PhysicalPage<Size4K>, FrameError> {
        if self.free == 0 {
            return Err(FrameError::OutOfMemory);
        }
        let idx = self
            .scan(self.hint, self.frames)
            .or_else(|| self.scan(FIRST_FRAME, self.hint.min(self.frames)))
            .ok_or(FrameError::OutOfMemory)?;
        self.set_bit(Bitmap::Used, idx);
        self.free -= 1;
        self.hint = idx + 1;
        Ok(PhysicalPage::from_frame_index(idx))
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if no free run of that length exists (or
    /// `count` is zero). Nothing is allocated in that case.
    pub fn allocate_contiguous(&mut self, count: u64) -> Result<PhysicalPage<Size4K>, FrameError> {
        self.allocate_contiguous_aligned(count, 1)
    }

    /// Allocate `count` contiguous frames whose first frame index is a
    /// multiple of `align_frames` (a power of two).
    ///
    /// # Errors
    /// As [`allocate_contiguous`](Self::allocate_contiguous).
    pub fn allocate_contiguous_aligned(
        &mut self,
        count: u64,
        align_frames: u64,
    ) -> Result<PhysicalPage<Size4K>, FrameError> {
        debug_assert!(align_frames.is_power_of_two());
        if count == 0 || count > self.free {
            return Err(FrameError::OutOfMemory);
        }

        let align = |idx: u64| idx.next_multiple_of(align_frames);
        let mut start = align(FIRST_FRAME);
        while start + count <= self.frames {
            match (start..start + count).find(|&i| self.is_set(Bitmap::Used, i)) {
                Some(taken) => start = align(taken + 1),
                None => {
                    for idx in start..start + count {
                        self.set_bit(Bitmap::Used, idx);
                    }
                    self.free -= count;
                    return Ok(PhysicalPage::from_frame_index(start));
                }
            }
        }
        Err(FrameError::OutOfMemory)
    }

    /// Allocate a naturally aligned 2 MiB frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if no aligned run of 512 frames is free.
    pub fn allocate_large(&mut self) -> Result<PhysicalPage<Size2M>, FrameError> {
        let first = self.allocate_contiguous_aligned(LARGE_FRAMES, LARGE_FRAMES)?;
        Ok(PhysicalPage::containing_address(first.base()))
    }

    /// Return one frame.
    ///
    /// # Errors
    /// - [`FrameError::Unmanaged`] if the frame is outside the bitmap.
    /// - [`FrameError::NotAllocated`] if it is free or reserved.
    pub fn free(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FrameError> {
        let idx = frame.frame_index();
        self.check_allocated(idx)?;
        self.clear_bit(Bitmap::Used, idx);
        self.free += 1;
        self.hint = idx;
        Ok(())
    }

    /// Return `count` frames starting at `first`. Nothing is freed unless
    /// every frame of the run is allocated.
    ///
    /// # Errors
    /// As [`free`](Self::free), for the first offending frame.
    pub fn free_contiguous(&mut self, first: PhysicalPage<Size4K>, count: u64) -> Result<(), FrameError> {
        let start = first.frame_index();
        let end = start.checked_add(count).ok_or(FrameError::Unmanaged)?;
        for idx in start..end {
            self.check_allocated(idx)?;
        }
        for idx in start..end {
            self.clear_bit(Bitmap::Used, idx);
        }
        self.free += count;
        self.hint = self.hint.min(start);
        Ok(())
    }

    /// Return a 2 MiB frame from [`allocate_large`](Self::allocate_large).
    ///
    /// # Errors
    /// As [`free_contiguous`](Self::free_contiguous).
    pub fn free_large(&mut self, frame: PhysicalPage<Size2M>) -> Result<(), FrameError> {
        self.free_contiguous(PhysicalPage::containing_address(frame.base()), LARGE_FRAMES)
    }

    fn check_allocated(&self, idx: u64) -> Result<(), FrameError> {
        if idx >= self.frames {
            return Err(FrameError::Unmanaged);
        }
        if self.is_set(Bitmap::Reserved, idx) || !self.is_set(Bitmap::Used, idx) {
            return Err(FrameError::NotAllocated);
        }
        Ok(())
    }

    /// First clear `used` bit in `from..to`.
    fn scan(&self, from: u64, to: u64) -> Option<u64> {
        let mut idx = from;
        while idx < to {
            let bit = idx % BITS;
            let word = self.used[(idx / BITS) as usize] | ((1 << bit) - 1);
            if word != u64::MAX {
                let found = idx - bit + u64::from(word.trailing_ones());
                return (found < to).then_some(found);
            }
            idx += BITS - bit;
        }
        None
    }

    #[inline]
    fn words(&self, which: Bitmap) -> &[u64] {
        match which {
            Bitmap::Used => &self.used[..],
            Bitmap::Reserved => &self.reserved[..],
        }
    }

    #[inline]
    fn words_mut(&mut self, which: Bitmap) -> &mut [u64] {
        match which {
            Bitmap::Used => &mut self.used[..],
            Bitmap::Reserved => &mut self.reserved[..],
        }
    }

    #[inline]
    fn is_set(&self, which: Bitmap, idx: u64) -> bool {
        self.words(which)[(idx / BITS) as usize] & (1 << (idx % BITS)) != 0
    }

    #[inline]
    fn set_bit(&mut self, which: Bitmap, idx: u64) {
        self.words_mut(which)[(idx / BITS) as usize] |= 1 << (idx % BITS);
    }

    #[inline]
    fn clear_bit(&mut self, which: Bitmap, idx: u64) {
        self.words_mut(which)[(idx / BITS) as usize] &= !(1 << (idx % BITS));
    }
}

#[derive(Copy, Clone)]
enum Bitmap {
    Used,
    Reserved,
}

impl FrameAlloc for BitmapFrameAlloc {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate().ok()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        let result = self.free(frame);
        if let Err(e) = result {
            log::warn!("free of {frame:?}: {e}");
        }
        debug_assert!(result.is_ok(), "invalid free of {frame:?}");
    }

    #[inline]
    fn alloc_2m(&mut self) -> Option<PhysicalPage<Size2M>> {
        self.allocate_large().ok()
    }

    fn free_2m(&mut self, frame: PhysicalPage<Size2M>) {
        let result = self.free_large(frame);
        if let Err(e) = result {
            log::warn!("free of {frame:?}: {e}");
        }
        debug_assert!(result.is_ok(), "invalid free of {frame:?}");
    }
}
