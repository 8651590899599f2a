//! # Address Spaces
//!
//! An [`AddressSpace`] is a PML4 root plus the [`RegionTable`] describing
//! what may be mapped under it. Leaves are installed lazily by
//! [`handle_page_fault`](AddressSpace::handle_page_fault) or eagerly at
//! [`map`](AddressSpace::map) time for [`Commit::Eager`] objects.
//!
//! ```text
//!   map(placement, pages, perms, object)
//!        │
//!        ├─► choose a free range in the window (first fit, 2 MiB aligned
//!        │   for large objects)
//!        ├─► insert Region { base, pages, perms, object }
//!        └─► Eager? resolve + install every page, roll back on OOM
//!
//!   fault(va, access)
//!        │
//!        ├─► binary search region ── none ──► FatalFault::NoRegion
//!        ├─► perms.allows(access) ── no ───► FatalFault::AccessViolation
//!        ├─► object.resolve(offset) ─ OOM ─► FatalFault::OutOfMemory
//!        └─► CAS leaf 0 → entry (a lost race is fine, same frame)
//! ```
//!
//! Objects with [`PageGranularity::Large`] get one `PS=1` page-directory
//! entry per 2 MiB; a fault anywhere inside resolves the whole large page.
//!
//! The kernel instance pre-populates every kernel-half PDPT; user instances
//! copy those PML4 entries, so kernel mappings made later are visible
//! everywhere without touching user roots.

use crate::object::{Backing, CachePolicy, Commit, PageGranularity, VmObject};
use crate::entry::PageTableEntry;
use crate::page_tables::{Install, PageTables};
use crate::region::{MAX_REGIONS, Region, RegionTable};
use crate::{FaultAccess, FrameAlloc, Mmu, Permissions, PhysMapper, ShootdownTarget, VmError};
use kernel_info::memory::{KERNEL_HALF_START, USER_SPACE_END};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualRange, align_down,
};

/// Which half of the address space an instance manages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    /// The single, immortal kernel instance. Leaves are global.
    Kernel,
    /// A per-task instance. Shares the kernel half, owns its user half.
    User,
}

/// Where [`AddressSpace::map`] should put a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Lowest free range in the window.
    Anywhere,
    /// Lowest free range at or above the address. Does not wrap around.
    Hint(VirtualAddress),
    /// Exactly at the address, or fail.
    Fixed(VirtualAddress),
}

/// A successfully handled fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Resolved {
    /// Frame now mapped at the faulting page.
    pub frame: PhysicalPage<Size4K>,
    /// `false` if another CPU (or an earlier fault) installed it first.
    pub newly_installed: bool,
}

/// Why a fault could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FaultReason {
    #[error("no region maps the address")]
    NoRegion,
    #[error("access not permitted by the region")]
    AccessViolation,
    #[error("out of memory while resolving")]
    OutOfMemory,
}

/// A fault the memory manager cannot fix. The faulting context must die.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unresolvable {access:?} fault at {address:?}: {reason}")]
pub struct FatalFault {
    pub address: VirtualAddress,
    pub access: FaultAccess,
    pub reason: FaultReason,
}

/// Page tables plus up to `N` regions of one address space.
///
/// Not internally synchronized; see the crate docs for the locking rules.
pub struct AddressSpace<M: PhysMapper, const N: usize = MAX_REGIONS> {
    tables: PageTables<M>,
    kind: SpaceKind,
    window: VirtualRange,
    regions: RegionTable<N>,
    torn_down: bool,
}

impl<M: PhysMapper, const N: usize> AddressSpace<M, N> {
    /// Create the kernel address space on a fresh root.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] if `window` is not in the kernel half.
    /// - [`VmError::OutOfMemory`] if the root or a PDPT could not be allocated.
    pub fn new_kernel<A: FrameAlloc + ?Sized>(
        mapper: M,
        window: VirtualRange,
        alloc: &mut A,
    ) -> Result<Self, VmError> {
        check_window(SpaceKind::Kernel, window)?;
        let tables = PageTables::allocate(mapper, alloc)?;
        Self::kernel_from_tables(tables, window, alloc)
    }

    /// Create the kernel address space on top of tables that are already
    /// live, such as the ones the bootloader left in CR3.
    ///
    /// # Safety
    /// `root` must be a valid PML4 reachable through `mapper` that stays
    /// allocated forever.
    ///
    /// # Errors
    /// As [`new_kernel`](Self::new_kernel).
    pub unsafe fn adopt_kernel<A: FrameAlloc + ?Sized>(
        mapper: M,
        root: PhysicalPage<Size4K>,
        window: VirtualRange,
        alloc: &mut A,
    ) -> Result<Self, VmError> {
        check_window(SpaceKind::Kernel, window)?;
        let tables = unsafe { PageTables::from_root(mapper, root) };
        Self::kernel_from_tables(tables, window, alloc)
    }

    fn kernel_from_tables<A: FrameAlloc + ?Sized>(
        tables: PageTables<M>,
        window: VirtualRange,
        alloc: &mut A,
    ) -> Result<Self, VmError> {
        let created = tables.populate_kernel_half(alloc)?;
        log::debug!(
            "kernel address space at {:?}: {created} kernel-half PDPTs allocated",
            tables.root()
        );
        Ok(Self {
            tables,
            kind: SpaceKind::Kernel,
            window,
            regions: RegionTable::new(),
            torn_down: false,
        })
    }

    /// Create a user address space that shares the kernel half of `kernel`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] if `kernel` is not the kernel space or
    ///   `window` reaches into the kernel half.
    /// - [`VmError::OutOfMemory`] if the root could not be allocated.
    pub fn new_user<A: FrameAlloc + ?Sized, const K: usize>(
        kernel: &AddressSpace<M, K>,
        window: VirtualRange,
        alloc: &mut A,
    ) -> Result<Self, VmError>
    where
        M: Clone,
    {
        if kernel.kind != SpaceKind::Kernel {
            return Err(VmError::InvalidArgument("user spaces derive from the kernel space"));
        }
        check_window(SpaceKind::User, window)?;
        let tables = PageTables::allocate(kernel.tables.mapper().clone(), alloc)?;
        tables.share_kernel_half(&kernel.tables);
        log::debug!("user address space at {:?}", tables.root());
        Ok(Self {
            tables,
            kind: SpaceKind::User,
            window,
            regions: RegionTable::new(),
            torn_down: false,
        })
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.tables.root()
    }

    /// Virtual range `map` allocates from.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        self.tables.mapper()
    }

    #[inline]
    #[must_use]
    pub const fn page_tables(&self) -> &PageTables<M> {
        &self.tables
    }

    /// Regions in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    #[must_use]
    pub fn region_containing(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .find_containing(va)
            .and_then(|i| self.regions.get(i))
    }

    /// Physical address `va` currently translates to, if a leaf is installed.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.tables.translate(va)
    }

    const fn shootdown_target(&self) -> ShootdownTarget {
        match self.kind {
            SpaceKind::Kernel => ShootdownTarget::AllCpus,
            SpaceKind::User => ShootdownTarget::CpusUsing(self.tables.root()),
        }
    }

    /// Map `pages` pages of `object` and return the chosen base.
    ///
    /// The object is consumed. On any error it is released again, so the
    /// caller never has to clean up.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for zero pages, more pages than the
    ///   object has, a misaligned placement address, permissions without
    ///   `read`, user permissions in the kernel space, or a large object
    ///   mapped partially or at a `Fixed` address off a 2 MiB boundary.
    /// - [`VmError::RangeUnavailable`] if no free range fits in the window,
    ///   or a `Fixed` range is taken or in the wrong half.
    /// - [`VmError::OutOfMemory`] if populating an eager object failed.
    pub fn map<A: FrameAlloc + ?Sized>(
        &mut self,
        placement: Placement,
        pages: u64,
        perms: Permissions,
        mut object: VmObject,
        alloc: &mut A,
    ) -> Result<VirtualAddress, VmError> {
        debug_assert!(!self.torn_down, "map on a destroyed address space");

        let base = match self.place(placement, pages, perms, &object) {
            Ok(base) => base,
            Err(e) => {
                object.release(self.tables.mapper(), alloc);
                return Err(e);
            }
        };

        let region = match Region::new(base, pages, perms, object) {
            Ok(region) => region,
            Err((e, mut object)) => {
                object.release(self.tables.mapper(), alloc);
                return Err(e);
            }
        };

        let index = match self.regions.insert(region) {
            Ok(index) => index,
            Err((e, region)) => {
                region.into_object().release(self.tables.mapper(), alloc);
                return Err(e);
            }
        };

        let eager = self
            .regions
            .get(index)
            .is_some_and(|r| r.object().commit() == Commit::Eager);
        if eager && let Err(e) = self.populate(index, alloc) {
            log::debug!("populating {pages} pages at {base:?} failed: {e}; rolling back");
            self.rollback(index, alloc);
            return Err(e);
        }

        log::debug!(
            "mapped {pages} pages at {base:?} ({:?}, {perms:?})",
            self.regions.get(index).map(|r| r.object().kind())
        );
        Ok(base)
    }

    fn place(
        &self,
        placement: Placement,
        pages: u64,
        perms: Permissions,
        object: &VmObject,
    ) -> Result<VirtualAddress, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument("mapping length must be non-zero"));
        }
        if pages > object.len_pages() {
            return Err(VmError::InvalidArgument("mapping longer than its object"));
        }
        if !perms.read() {
            return Err(VmError::InvalidArgument("mappings must be readable"));
        }
        if self.kind == SpaceKind::Kernel && perms.user() {
            return Err(VmError::InvalidArgument("user permissions in the kernel space"));
        }
        let granularity = object.granularity();
        if !pages.is_multiple_of(granularity.pages()) {
            return Err(VmError::InvalidArgument("large objects are mapped in whole 2 MiB pages"));
        }
        let align = granularity.bytes();

        match placement {
            Placement::Anywhere => self
                .regions
                .find_free(&self.window, pages, self.window.start, align)
                .ok_or(VmError::RangeUnavailable),
            Placement::Hint(va) => {
                if !va.is_aligned::<Size4K>() {
                    return Err(VmError::InvalidArgument("placement address must be page aligned"));
                }
                self.regions
                    .find_free(&self.window, pages, va, align)
                    .ok_or(VmError::RangeUnavailable)
            }
            Placement::Fixed(va) => {
                if !va.is_aligned::<Size4K>() {
                    return Err(VmError::InvalidArgument("placement address must be page aligned"));
                }
                if granularity == PageGranularity::Large && !va.is_aligned::<Size2M>() {
                    return Err(VmError::InvalidArgument("large objects need a 2 MiB aligned address"));
                }
                let range = VirtualRange::from_pages(va, pages).ok_or(VmError::RangeUnavailable)?;
                if self.fixed_allowed(&range) && self.regions.is_free(&range) {
                    Ok(va)
                } else {
                    Err(VmError::RangeUnavailable)
                }
            }
        }
    }

    /// Kernel `Fixed` mappings may go anywhere in the kernel half (the heap
    /// reserve lives outside the search window); user ones stay in the window.
    const fn fixed_allowed(&self, range: &VirtualRange) -> bool {
        match self.kind {
            SpaceKind::Kernel => range.start.as_u64() >= KERNEL_HALF_START,
            SpaceKind::User => self.window.contains_range(range),
        }
    }

    /// Resolve and install every page of region `index`.
    fn populate<A: FrameAlloc + ?Sized>(&mut self, index: usize, alloc: &mut A) -> Result<(), VmError> {
        let global = self.kind == SpaceKind::Kernel;
        let region = self
            .regions
            .get_mut(index)
            .ok_or(VmError::InvalidArgument("no such region"))?;
        let (base, perms) = (region.base(), region.permissions());
        let cache = region.object().cache_policy();
        let granularity = region.object().granularity();
        let step = granularity.pages();
        for offset in (0..region.pages() / step).map(|leaf| leaf * step) {
            let first = region
                .object_mut()
                .resolve(self.tables.mapper(), alloc, offset)?;
            let va = VirtualAddress::new(base.as_u64() + offset * 4096);
            let entry = leaf_entry(granularity, first, perms, cache, global);
            install_leaf(&self.tables, va, entry, alloc)?;
        }
        Ok(())
    }

    /// Clear every leaf in `range`. Returns the number of 4 KiB pages that
    /// were mapped.
    fn clear_leaves(&self, range: VirtualRange, granularity: PageGranularity) -> u64 {
        match granularity {
            PageGranularity::Small => range
                .iter_pages()
                .filter(|page| self.tables.clear(page.base()).is_some())
                .count() as u64,
            PageGranularity::Large => {
                let leaves = range.pages() / granularity.pages();
                let cleared = (0..leaves)
                    .map(|leaf| range.start + leaf * granularity.bytes())
                    .filter(|&va| self.tables.clear_large(va).is_some())
                    .count() as u64;
                cleared * granularity.pages()
            }
        }
    }

    /// Undo a half-populated mapping. The range was never returned to
    /// anyone, so no TLB can hold it.
    fn rollback<A: FrameAlloc + ?Sized>(&mut self, index: usize, alloc: &mut A) {
        if let Some(region) = self.regions.remove(index) {
            let range = region.range();
            self.clear_leaves(range, region.object().granularity());
            let detached = self.tables.detach_empty_tables(&range);
            self.tables.free_detached(detached, alloc);
            region.into_object().release(self.tables.mapper(), alloc);
        }
    }

    /// Remove the region starting at `base`.
    ///
    /// Leaves are cleared and the TLBs of every CPU that may hold them are
    /// invalidated before any frame goes back to the allocator. Page tables
    /// left without a leaf are freed as well.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if no region starts at `base`.
    pub fn unmap<A: FrameAlloc + ?Sized, U: Mmu + ?Sized>(
        &mut self,
        base: VirtualAddress,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), VmError> {
        let index = self
            .regions
            .index_of_base(base)
            .ok_or(VmError::InvalidArgument("no region starts at this address"))?;
        let (range, granularity) = self
            .regions
            .get(index)
            .map(|r| (r.range(), r.object().granularity()))
            .ok_or(VmError::InvalidArgument("no region starts at this address"))?;

        let cleared = self.clear_leaves(range, granularity);
        let detached = self.tables.detach_empty_tables(&range);
        mmu.invalidate(self.shootdown_target(), range);
        let tables = self.tables.free_detached(detached, alloc);

        if let Some(region) = self.regions.remove(index) {
            region.into_object().release(self.tables.mapper(), alloc);
        }
        log::debug!(
            "unmapped {} pages at {base:?} ({cleared} were resident, {tables} tables freed)",
            range.pages()
        );
        Ok(())
    }

    /// Resolve a fault at `va`.
    ///
    /// Must be called with the owner's lock held. Repeating a resolved
    /// fault, or racing another CPU on the same page, yields the same frame.
    ///
    /// # Errors
    /// A [`FatalFault`] describing why the access cannot be satisfied.
    pub fn handle_page_fault<A: FrameAlloc + ?Sized>(
        &mut self,
        va: VirtualAddress,
        access: FaultAccess,
        alloc: &mut A,
    ) -> Result<Resolved, FatalFault> {
        let fatal = |reason| FatalFault {
            address: va,
            access,
            reason,
        };
        if !va.is_canonical() {
            return Err(fatal(FaultReason::NoRegion));
        }

        let global = self.kind == SpaceKind::Kernel;
        let region = self
            .regions
            .find_containing(va)
            .and_then(|i| self.regions.get_mut(i))
            .ok_or_else(|| fatal(FaultReason::NoRegion))?;

        let perms = region.permissions();
        if !perms.allows(access) {
            return Err(fatal(FaultReason::AccessViolation));
        }

        let granularity = region.object().granularity();
        let offset = region.offset_of(va);
        let within = offset % granularity.pages();
        let cache = region.object().cache_policy();
        let first = region
            .object_mut()
            .resolve(self.tables.mapper(), alloc, offset - within)
            .map_err(|e| fatal(fault_reason(e)))?;

        let leaf = VirtualAddress::new(align_down(va.as_u64(), granularity.bytes()));
        let entry = leaf_entry(granularity, first, perms, cache, global);
        let resolved = match install_leaf(&self.tables, leaf, entry, alloc) {
            Ok(Install::Installed) => Resolved {
                frame: first.add(within),
                newly_installed: true,
            },
            Ok(Install::AlreadyPresent(existing)) => Resolved {
                frame: existing.frame().add(within),
                newly_installed: false,
            },
            Err(e) => return Err(fatal(fault_reason(e))),
        };
        log::trace!(
            "fault at {va:?} ({access:?}) -> {:?}{}",
            resolved.frame,
            if resolved.newly_installed { "" } else { " (already present)" }
        );
        Ok(resolved)
    }

    /// Make this the active address space on the calling CPU.
    pub fn switch_to<U: Mmu + ?Sized>(&self, mmu: &U) {
        debug_assert!(!self.torn_down, "switch to a destroyed address space");
        // SAFETY: every instance maps the shared kernel half.
        unsafe { mmu.load_root(self.tables.root()) };
    }

    /// Tear a user space down: release every region, free the user-half
    /// tables and the root.
    ///
    /// The space must no longer be loaded on any CPU; only the calling CPU
    /// can be checked here. The user window is still shot down on every CPU
    /// that used this root before a frame is released, so stale TLB entries
    /// cannot outlive their frames.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for the kernel space, a space that is
    /// already destroyed, or one that is active on the calling CPU.
    pub fn destroy<A: FrameAlloc + ?Sized, U: Mmu + ?Sized>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), VmError> {
        if self.kind == SpaceKind::Kernel {
            return Err(VmError::InvalidArgument("the kernel space is never destroyed"));
        }
        if self.torn_down {
            return Err(VmError::InvalidArgument("address space already destroyed"));
        }
        if mmu.active_root() == self.tables.root() {
            return Err(VmError::InvalidArgument("address space is still active"));
        }

        mmu.invalidate(self.shootdown_target(), self.window);

        let regions = self.regions.len();
        while let Some(region) = self
            .regions
            .len()
            .checked_sub(1)
            .and_then(|last| self.regions.remove(last))
        {
            region.into_object().release(self.tables.mapper(), alloc);
        }
        let tables = self.tables.free_user_half(alloc);
        alloc.free_4k(self.tables.root());
        self.torn_down = true;
        log::debug!(
            "destroyed address space {:?}: {regions} regions, {tables} tables",
            self.tables.root()
        );
        Ok(())
    }
}

impl<M: PhysMapper, const N: usize> Drop for AddressSpace<M, N> {
    fn drop(&mut self) {
        if self.kind == SpaceKind::User && !self.torn_down {
            log::warn!(
                "user address space {:?} dropped without destroy; its frames are leaked",
                self.tables.root()
            );
        }
    }
}

/// The leaf mapping `first` (the lowest 4 KiB frame of the leaf).
const fn leaf_entry(
    granularity: PageGranularity,
    first: PhysicalPage<Size4K>,
    perms: Permissions,
    cache: CachePolicy,
    global: bool,
) -> PageTableEntry {
    match granularity {
        PageGranularity::Small => PageTableEntry::leaf(first, perms, cache, global),
        PageGranularity::Large => {
            PageTableEntry::large_leaf(PhysicalPage::containing_address(first.base()), perms, cache, global)
        }
    }
}

/// Install `entry` at the level its `huge` bit calls for.
fn install_leaf<M: PhysMapper, A: FrameAlloc + ?Sized>(
    tables: &PageTables<M>,
    va: VirtualAddress,
    entry: PageTableEntry,
    alloc: &mut A,
) -> Result<Install, VmError> {
    if !entry.huge() {
        return tables.install(va, entry, alloc);
    }
    match tables.install_large(va, entry, alloc)? {
        // A page table still occupies the slot.
        Install::AlreadyPresent(existing) if !existing.huge() => Err(VmError::RangeUnavailable),
        installed => Ok(installed),
    }
}

const fn fault_reason(e: VmError) -> FaultReason {
    match e {
        VmError::OutOfMemory => FaultReason::OutOfMemory,
        VmError::RangeUnavailable | VmError::InvalidArgument(_) => FaultReason::AccessViolation,
    }
}

const fn check_window(kind: SpaceKind, window: VirtualRange) -> Result<(), VmError> {
    let (start, end) = (window.start.as_u64(), window.end.as_u64());
    if start & 0xFFF != 0 || end & 0xFFF != 0 || start >= end {
        return Err(VmError::InvalidArgument("window must be a non-empty page-aligned range"));
    }
    let inside = match kind {
        SpaceKind::Kernel => start >= KERNEL_HALF_START,
        SpaceKind::User => end <= USER_SPACE_END,
    };
    if inside {
        Ok(())
    } else {
        Err(VmError::InvalidArgument("window is in the wrong half"))
    }
}
