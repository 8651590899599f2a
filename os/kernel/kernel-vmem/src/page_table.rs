use crate::PhysMapper;
use crate::entry::PageTableEntry;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Level of a table in the 4-level walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TableLevel {
    /// Page Table, holds 4 KiB leaves.
    Pt = 0,
    /// Page Directory.
    Pd = 1,
    /// Page Directory Pointer Table.
    Pdpt = 2,
    /// Page Map Level 4, the root.
    Pml4 = 3,
}

impl TableLevel {
    /// Index of the entry for `va` in a table of this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        let shift = 12 + 9 * (self as u64);
        ((va.as_u64() >> shift) & 0x1FF) as usize
    }

    /// Bytes of address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << (12 + 9 * (self as u64))
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

/// One 4 KiB page-table frame of 512 entries, at any level.
///
/// Entries are atomics so several CPUs can walk and fill the same tables
/// through shared references; an all-zero frame is an empty table.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// View a table frame through the physical mapper.
    ///
    /// # Safety
    /// `frame` must hold a page table (or zeroes) and stay allocated for `'a`.
    #[inline]
    pub unsafe fn from_frame<'a, M: PhysMapper + ?Sized>(
        mapper: &M,
        frame: PhysicalPage<Size4K>,
    ) -> &'a Self {
        unsafe { &*mapper.phys_to_ptr(frame.base()).cast::<Self>() }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, index: usize, entry: PageTableEntry) {
        self.entries[index].store(entry.into_bits(), Ordering::Release);
    }

    /// Store `entry` only if the slot is still empty.
    ///
    /// # Errors
    /// Returns the entry that was already there.
    #[inline]
    pub fn install(&self, index: usize, entry: PageTableEntry) -> Result<(), PageTableEntry> {
        self.entries[index]
            .compare_exchange(0, entry.into_bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PageTableEntry::from_bits)
    }

    /// Clear the slot and return what it held.
    #[inline]
    pub fn take(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[index].swap(0, Ordering::AcqRel))
    }

    /// Indices and values of all present entries in `range`.
    pub fn present_entries(
        &self,
        range: core::ops::Range<usize>,
    ) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        range
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.present())
    }
}
