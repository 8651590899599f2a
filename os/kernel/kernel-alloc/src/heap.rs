//! # Kernel Heap
//!
//! A first-fit free list over a reserved virtual range that is committed on
//! demand. Every allocation is preceded by an [`AllocHeader`]:
//!
//! ```text
//!  block.start                payload (aligned)               block.end
//!  │                          │                               │
//!  ▼                          ▼                               ▼
//!  ┌────────┬─────────────────┬───────────────────────────────┐
//!  │ (pad)  │ AllocHeader 32B │ payload (size, 16-rounded)    │
//!  └────────┴─────────────────┴───────────────────────────────┘
//! ```
//!
//! When nothing fits, the heap asks its [`HeapBacking`] to commit the next
//! chunk right behind the committed extent. Chunks touch, so a new chunk
//! merges with a free tail. The extent never shrinks.

use crate::free_list::{Block, FreeList, GRANULE};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::VmError;

/// Tag of a live allocation header.
const MAGIC_LIVE: u64 = 0x4B48_4541_5041_4C43;
/// Tag left behind by `free`; a second free of the block sees it.
const MAGIC_FREED: u64 = 0x4B48_4541_5046_5245;

/// Header in front of every payload.
///
/// `magic` sits past the first 16 bytes so the free-list node written over
/// a freed block does not clobber it.
#[repr(C)]
struct AllocHeader {
    block_start: usize,
    block_end: usize,
    size: usize,
    magic: u64,
}

pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

const _: () = assert!(HEADER_SIZE == 32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    /// The reserve is exhausted or the backing could not commit memory.
    #[error("kernel heap out of memory")]
    OutOfMemory,
    /// Zero size or a non-power-of-two alignment.
    #[error("invalid allocation request")]
    InvalidArgument,
    /// Not a live allocation of this heap.
    #[error("invalid free")]
    InvalidFree,
}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory | VmError::RangeUnavailable => Self::OutOfMemory,
            VmError::InvalidArgument(_) => Self::InvalidArgument,
        }
    }
}

/// Where heap memory comes from.
pub trait HeapBacking {
    /// The virtual range the heap may ever grow into.
    fn reserved(&self) -> VirtualRange;

    /// Make `[at, at + bytes)` readable and writable memory.
    ///
    /// `at` directly follows the committed extent and both are page aligned.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the memory cannot be provided.
    fn commit(&mut self, at: VirtualAddress, bytes: u64) -> Result<(), HeapError>;
}

/// Snapshot of the heap counters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Size of the reserved range.
    pub reserved: u64,
    /// Bytes committed so far (the high-water mark).
    pub committed: u64,
    /// Bytes held by live allocations, headers and padding included.
    pub in_use: usize,
    pub allocations: usize,
}

/// The kernel heap.
pub struct Heap<B: HeapBacking> {
    backing: B,
    reserve: VirtualRange,
    committed_end: u64,
    granule: u64,
    free: FreeList,
    in_use: usize,
    allocations: usize,
}

impl<B: HeapBacking> Heap<B> {
    /// A heap over `backing` that grows by at least `granule` bytes at a
    /// time. Nothing is committed until the first allocation.
    #[must_use]
    pub fn new(backing: B, granule: u64) -> Self {
        let reserve = backing.reserved();
        debug_assert!(reserve.start.as_u64().is_multiple_of(PAGE_SIZE));
        Self {
            backing,
            reserve,
            committed_end: reserve.start.as_u64(),
            granule: granule.next_multiple_of(PAGE_SIZE).max(PAGE_SIZE),
            free: FreeList::new(),
            in_use: 0,
            allocations: 0,
        }
    }

    #[must_use]
    pub const fn backing(&self) -> &B {
        &self.backing
    }

    /// The part of the reserve that is backed by memory.
    #[must_use]
    pub const fn committed(&self) -> VirtualRange {
        VirtualRange::new(self.reserve.start, VirtualAddress::new(self.committed_end))
    }

    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        HeapStats {
            reserved: self.reserve.len(),
            committed: self.committed_end - self.reserve.start.as_u64(),
            in_use: self.in_use,
            allocations: self.allocations,
        }
    }

    /// Allocate `size` bytes aligned to `align` (at least 16).
    ///
    /// # Errors
    /// - [`HeapError::InvalidArgument`] for zero `size` or a bad `align`.
    /// - [`HeapError::OutOfMemory`] if the heap cannot grow far enough.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<core::ptr::NonNull<u8>, HeapError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(HeapError::InvalidArgument);
        }
        let align = align.max(GRANULE);

        let block = match unsafe { self.free.take(size, align, HEADER_SIZE) } {
            Some(block) => block,
            None => {
                self.grow(size, align)?;
                unsafe { self.free.take(size, align, HEADER_SIZE) }.ok_or(HeapError::OutOfMemory)?
            }
        };

        let Block { start, payload, end } = block;
        // SAFETY: the block lies in committed memory and is exclusively ours.
        unsafe {
            ((payload - HEADER_SIZE) as *mut AllocHeader).write(AllocHeader {
                block_start: start,
                block_end: end,
                size,
                magic: MAGIC_LIVE,
            });
        }
        self.in_use += end - start;
        self.allocations += 1;
        core::ptr::NonNull::new(payload as *mut u8).ok_or(HeapError::OutOfMemory)
    }

    /// Return an allocation.
    ///
    /// # Errors
    /// [`HeapError::InvalidFree`] if `ptr` is outside the committed extent,
    /// its header is damaged or already freed, or (in debug builds) its
    /// block overlaps free memory.
    ///
    /// # Safety
    /// If `ptr` came from this heap, it must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let addr = ptr as usize;
        let lowest = self.reserve.start.as_u64() as usize + HEADER_SIZE;
        if addr < lowest || addr as u64 >= self.committed_end || addr % GRANULE != 0 {
            return Err(HeapError::InvalidFree);
        }

        let header = (addr - HEADER_SIZE) as *mut AllocHeader;
        // SAFETY: the header address lies in committed heap memory.
        let AllocHeader {
            block_start,
            block_end,
            size,
            magic,
        } = unsafe { header.read() };
        if magic != MAGIC_LIVE {
            return Err(HeapError::InvalidFree);
        }
        let sane = block_start <= addr - HEADER_SIZE
            && block_start >= self.reserve.start.as_u64() as usize
            && addr.checked_add(size).is_some_and(|e| e <= block_end)
            && block_end as u64 <= self.committed_end
            && block_start % GRANULE == 0
            && block_end % GRANULE == 0;
        if !sane {
            return Err(HeapError::InvalidFree);
        }
        if cfg!(debug_assertions) && self.free.overlaps(block_start, block_end) {
            return Err(HeapError::InvalidFree);
        }

        unsafe {
            (&raw mut (*header).magic).write(MAGIC_FREED);
            self.free.insert(block_start, block_end - block_start);
        }
        self.in_use -= block_end - block_start;
        self.allocations -= 1;
        Ok(())
    }

    /// Commit enough to satisfy a `size`/`align` request from a fresh chunk.
    fn grow(&mut self, size: usize, align: usize) -> Result<(), HeapError> {
        let worst = (size as u64)
            .checked_add((align + HEADER_SIZE + GRANULE) as u64)
            .ok_or(HeapError::OutOfMemory)?;
        let remaining = self.reserve.end.as_u64() - self.committed_end;
        let needed = worst
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(HeapError::OutOfMemory)?;
        if needed > remaining {
            return Err(HeapError::OutOfMemory);
        }
        let bytes = needed.max(self.granule).min(remaining);

        let at = VirtualAddress::new(self.committed_end);
        self.backing.commit(at, bytes)?;
        self.committed_end += bytes;
        log::debug!(
            "kernel heap grew by {} KiB to {} KiB",
            bytes / 1024,
            (self.committed_end - self.reserve.start.as_u64()) / 1024
        );
        unsafe {
            self.free.insert(at.as_u64() as usize, bytes as usize);
        }
        Ok(())
    }
}
