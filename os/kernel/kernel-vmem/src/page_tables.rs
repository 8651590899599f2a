//! Walking and filling one 4-level page-table tree.

use crate::entry::PageTableEntry;
use crate::page_table::{PageTable, TableLevel};
use crate::{FrameAlloc, PhysMapper, VmError, alloc_zeroed};
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_PML4_START};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualRange, align_down,
};

/// Outcome of installing a leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Install {
    /// The slot was empty and now holds the new entry.
    Installed,
    /// Another mapping was already present; nothing was written.
    AlreadyPresent(PageTableEntry),
}

/// Page tables unlinked from the tree but not yet freed.
#[derive(Debug)]
#[must_use = "detached tables are leaked unless passed to `free_detached`"]
pub struct DetachedTables {
    head: Option<PhysicalPage<Size4K>>,
    count: usize,
}

impl DetachedTables {
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A PML4 root and the mapper used to reach its tables.
///
/// Holds no lock. Intermediate tables are linked with compare-and-swap, so
/// concurrent walkers never lose a table or leak a frame.
pub struct PageTables<M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: M,
}

impl<M: PhysMapper> PageTables<M> {
    /// Allocate a fresh, empty root.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no frame is available.
    pub fn allocate<A: FrameAlloc + ?Sized>(mapper: M, alloc: &mut A) -> Result<Self, VmError> {
        let root = alloc_zeroed(&mapper, alloc)?;
        Ok(Self { root, mapper })
    }

    /// Wrap an existing root, e.g. the tables the bootloader left in CR3.
    ///
    /// # Safety
    /// `root` must be a valid PML4 reachable through `mapper`.
    pub const unsafe fn from_root(mapper: M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    #[inline]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    fn table(&self, frame: PhysicalPage<Size4K>) -> &PageTable {
        // SAFETY: every frame we walk into was linked by us or by the boot
        // tables and stays allocated while the tree lives.
        unsafe { PageTable::from_frame(&self.mapper, frame) }
    }

    #[inline]
    fn pml4(&self) -> &PageTable {
        self.table(self.root)
    }

    /// Follow `table[index]`, linking a new zeroed table if the slot is empty.
    fn next_or_create<A: FrameAlloc + ?Sized>(
        &self,
        table: &PageTable,
        index: usize,
        user: bool,
        alloc: &mut A,
    ) -> Result<&PageTable, VmError> {
        let e = table.get(index);
        if e.present() {
            if e.huge() {
                return Err(VmError::InvalidArgument(
                    "address is covered by a large-page mapping",
                ));
            }
            return Ok(self.table(e.frame()));
        }

        let frame = alloc_zeroed(&self.mapper, alloc)?;
        match table.install(index, PageTableEntry::table(frame, user)) {
            Ok(()) => Ok(self.table(frame)),
            Err(winner) => {
                // Someone linked a table first; use theirs.
                alloc.free_4k(frame);
                Ok(self.table(winner.frame()))
            }
        }
    }

    /// The table at `level` on the walk to `va`, creating missing levels.
    fn table_or_create<A: FrameAlloc + ?Sized>(
        &self,
        va: VirtualAddress,
        level: TableLevel,
        alloc: &mut A,
    ) -> Result<&PageTable, VmError> {
        let user = TableLevel::Pml4.index_of(va) < KERNEL_PML4_START;
        let mut table = self.pml4();
        let mut current = TableLevel::Pml4;
        while current > level
            && let Some(next) = current.next()
        {
            table = self.next_or_create(table, current.index_of(va), user, alloc)?;
            current = next;
        }
        Ok(table)
    }

    /// The table at `level` on the walk to `va`, if the walk reaches it.
    fn table_at(&self, va: VirtualAddress, level: TableLevel) -> Option<&PageTable> {
        let mut table = self.pml4();
        let mut current = TableLevel::Pml4;
        while current > level {
            let e = table.get(current.index_of(va));
            if !e.present() || e.huge() {
                return None;
            }
            table = self.table(e.frame());
            current = current.next()?;
        }
        Some(table)
    }

    /// Install a 4 KiB leaf for `va` if no translation exists yet.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if an intermediate table could not be allocated.
    /// - [`VmError::InvalidArgument`] if a 2 MiB leaf already covers `va`.
    pub fn install<A: FrameAlloc + ?Sized>(
        &self,
        va: VirtualAddress,
        entry: PageTableEntry,
        alloc: &mut A,
    ) -> Result<Install, VmError> {
        let pt = self.table_or_create(va, TableLevel::Pt, alloc)?;
        Ok(match pt.install(TableLevel::Pt.index_of(va), entry) {
            Ok(()) => Install::Installed,
            Err(existing) => Install::AlreadyPresent(existing),
        })
    }

    /// Install a 2 MiB leaf for the 2 MiB aligned `va` if its page-directory
    /// slot is empty.
    ///
    /// A slot that already links a page table is reported as
    /// [`Install::AlreadyPresent`] with that table entry (`huge` clear).
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a misaligned `va` or an entry
    ///   without `huge`.
    /// - [`VmError::OutOfMemory`] if an intermediate table could not be allocated.
    pub fn install_large<A: FrameAlloc + ?Sized>(
        &self,
        va: VirtualAddress,
        entry: PageTableEntry,
        alloc: &mut A,
    ) -> Result<Install, VmError> {
        if !va.is_aligned::<Size2M>() || !entry.huge() {
            return Err(VmError::InvalidArgument("large leaves need a 2 MiB aligned address"));
        }
        let pd = self.table_or_create(va, TableLevel::Pd, alloc)?;
        Ok(match pd.install(TableLevel::Pd.index_of(va), entry) {
            Ok(()) => Install::Installed,
            Err(existing) => Install::AlreadyPresent(existing),
        })
    }

    /// Remove the 4 KiB leaf for `va`, returning it if one was present.
    pub fn clear(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pt = self.table_at(va, TableLevel::Pt)?;
        let old = pt.take(TableLevel::Pt.index_of(va));
        old.present().then_some(old)
    }

    /// Remove the 2 MiB leaf covering `va`, returning it if one was present.
    /// A linked page table is left alone.
    pub fn clear_large(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pd = self.table_at(va, TableLevel::Pd)?;
        let index = TableLevel::Pd.index_of(va);
        let e = pd.get(index);
        (e.present() && e.huge()).then(|| pd.take(index))
    }

    /// The 4 KiB leaf for `va`, if present.
    pub fn entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let e = self.table_at(va, TableLevel::Pt)?.get(TableLevel::Pt.index_of(va));
        e.present().then_some(e)
    }

    /// Unlink every page table under `range` that no longer holds a leaf.
    ///
    /// The tables stay allocated, chained through their first entry, until
    /// handed to [`free_detached`](Self::free_detached). That must only happen
    /// after the TLBs were shot down for `range`, since paging-structure
    /// caches may still point at them.
    pub fn detach_empty_tables(&self, range: &VirtualRange) -> DetachedTables {
        let mut detached = DetachedTables { head: None, count: 0 };
        let mut slot = align_down(range.start.as_u64(), Size2M::SIZE);
        while slot < range.end.as_u64() {
            let va = VirtualAddress::new(slot);
            if let Some(pd) = self.table_at(va, TableLevel::Pd) {
                let index = TableLevel::Pd.index_of(va);
                let e = pd.get(index);
                if e.present()
                    && !e.huge()
                    && self.table(e.frame()).present_entries(0..ENTRIES_PER_TABLE).next().is_none()
                {
                    pd.take(index);
                    let link = detached
                        .head
                        .map_or(PageTableEntry::new(), |next| PageTableEntry::new().with_frame(next));
                    self.table(e.frame()).set(0, link);
                    detached.head = Some(e.frame());
                    detached.count += 1;
                }
            }
            let Some(next) = slot.checked_add(Size2M::SIZE) else {
                break;
            };
            slot = next;
        }
        detached
    }

    /// Free tables from [`detach_empty_tables`](Self::detach_empty_tables).
    pub fn free_detached<A: FrameAlloc + ?Sized>(&self, detached: DetachedTables, alloc: &mut A) -> usize {
        let mut cursor = detached.head;
        for _ in 0..detached.count {
            let Some(frame) = cursor else {
                break;
            };
            cursor = Some(self.table(frame).get(0).frame());
            alloc.free_4k(frame);
        }
        detached.count
    }

    /// Full software walk, including large leaves left by the bootloader.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.pml4();
        let mut level = TableLevel::Pml4;
        loop {
            let e = table.get(level.index_of(va));
            if !e.present() {
                return None;
            }
            let span = level.entry_span();
            if level == TableLevel::Pt || (e.huge() && level != TableLevel::Pml4) {
                let base = e.physical_address().as_u64() & !(span - 1);
                return Some(PhysicalAddress::new(base + (va.as_u64() & (span - 1))));
            }
            table = self.table(e.frame());
            level = level.next()?;
        }
    }

    /// Make sure every kernel-half PML4 slot points at a PDPT.
    ///
    /// Called once for the kernel tree; afterwards the kernel half never
    /// needs a new PML4 entry, so copies of those entries stay valid.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a PDPT could not be allocated. Tables
    /// linked before the failure stay linked.
    pub fn populate_kernel_half<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
    ) -> Result<usize, VmError> {
        let pml4 = self.pml4();
        let mut created = 0;
        for index in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            if !pml4.get(index).present() {
                let frame = alloc_zeroed(&self.mapper, alloc)?;
                match pml4.install(index, PageTableEntry::table(frame, false)) {
                    Ok(()) => created += 1,
                    Err(_) => alloc.free_4k(frame),
                }
            }
        }
        Ok(created)
    }

    /// Alias the kernel half of `kernel` into this (fresh) tree.
    pub fn share_kernel_half(&self, kernel: &Self) {
        let src = kernel.pml4();
        let dst = self.pml4();
        for index in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            dst.set(index, src.get(index));
        }
    }

    /// Free every table below the user half of the PML4 and clear those
    /// slots. Leaf frames are not touched; they belong to VM objects.
    pub fn free_user_half<A: FrameAlloc + ?Sized>(&self, alloc: &mut A) -> usize {
        let pml4 = self.pml4();
        let mut freed = 0;
        for (index, e) in pml4.present_entries(0..KERNEL_PML4_START) {
            freed += self.free_subtree(e.frame(), TableLevel::Pdpt, alloc);
            pml4.take(index);
        }
        freed
    }

    fn free_subtree<A: FrameAlloc + ?Sized>(
        &self,
        frame: PhysicalPage<Size4K>,
        level: TableLevel,
        alloc: &mut A,
    ) -> usize {
        let mut freed = 0;
        if level != TableLevel::Pt {
            let table = self.table(frame);
            for (_, e) in table.present_entries(0..ENTRIES_PER_TABLE) {
                if !e.huge()
                    && let Some(next) = level.next()
                {
                    freed += self.free_subtree(e.frame(), next, alloc);
                }
            }
        }
        alloc.free_4k(frame);
        freed + 1
    }
}
