mod common;

use common::{FIRST_MANAGED_FRAME, RamMapper, RecordingMmu, TestFrames, TestRam};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualRange};
use kernel_vmem::info::{kernel_window, user_window};
use kernel_vmem::{
    AccessKind, AddressSpace, Commit, FaultAccess, FrameAlloc, FaultReason, PageGranularity,
    Permissions, Placement, ShootdownTarget, SpaceKind, VmError, VmObject,
};

const RAM_FRAMES: usize = 2048;

/// Root plus one PDPT per kernel-half PML4 slot.
const KERNEL_SPACE_FRAMES: usize = 1 + 256;

fn kernel_space(ram: &TestRam, frames: &mut TestFrames) -> AddressSpace<RamMapper> {
    AddressSpace::new_kernel(ram.mapper(), kernel_window(), frames).unwrap()
}

fn lazy(pages: u64) -> VmObject {
    VmObject::memory_backed(pages, Commit::Lazy).unwrap()
}

fn page(base: VirtualAddress, n: u64) -> VirtualAddress {
    base + n * 4096
}

#[test]
fn kernel_space_preallocates_the_kernel_half() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let kernel = kernel_space(&ram, &mut frames);
    assert_eq!(kernel.kind(), SpaceKind::Kernel);
    assert_eq!(frames.outstanding(), KERNEL_SPACE_FRAMES);
    assert_eq!(kernel.regions().count(), 0);
}

#[test]
fn map_unmap_and_remap_three_pages() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let base = user
        .map(Placement::Anywhere, 3, Permissions::USER_RW, lazy(3), &mut frames)
        .unwrap();
    assert!(base.is_aligned::<Size4K>());
    assert_eq!(base, user_window().start);

    let before = frames.outstanding();
    for n in 0..3 {
        let r = user
            .handle_page_fault(page(base, n), FaultAccess::user(AccessKind::Write), &mut frames)
            .unwrap();
        assert!(r.newly_installed);
        assert!(frames.is_outstanding(r.frame));
    }
    // 3 data frames, 1 object table frame, PDPT + PD + PT.
    assert_eq!(frames.outstanding(), before + 7);

    user.unmap(base, &mut frames, &mmu).unwrap();
    assert_eq!(
        mmu.invalidations(),
        [(
            ShootdownTarget::CpusUsing(user.root()),
            VirtualRange::from_pages(base, 3).unwrap()
        )]
    );
    // The emptied PT goes back; PDPT and PD stay until the space is destroyed.
    assert_eq!(frames.outstanding(), before + 2);
    assert!(user.translate(base).is_none());

    let again = user
        .map(Placement::Anywhere, 3, Permissions::USER_RW, lazy(3), &mut frames)
        .unwrap();
    assert_eq!(again, base);

    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(frames.outstanding(), KERNEL_SPACE_FRAMES);
}

#[test]
fn fault_after_unmap_is_fatal() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);

    let base = kernel
        .map(Placement::Anywhere, 2, Permissions::RW, lazy(2), &mut frames)
        .unwrap();
    let access = FaultAccess::kernel(AccessKind::Read);
    kernel
        .handle_page_fault(page(base, 1), access, &mut frames)
        .unwrap();

    kernel.unmap(base, &mut frames, &mmu).unwrap();
    assert_eq!(mmu.invalidations()[0].0, ShootdownTarget::AllCpus);

    for n in 0..2 {
        let fatal = kernel
            .handle_page_fault(page(base, n), access, &mut frames)
            .unwrap_err();
        assert_eq!(fatal.reason, FaultReason::NoRegion);
        assert_eq!(fatal.address, page(base, n));
    }
}

#[test]
fn mmio_resolves_to_its_base_uncached() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);

    let object = VmObject::mmio(PhysicalAddress::new(0x1000), 1).unwrap();
    let va = kernel
        .map(Placement::Anywhere, 1, Permissions::RW, object, &mut frames)
        .unwrap();

    let r = kernel
        .handle_page_fault(va + 0x10, FaultAccess::kernel(AccessKind::Write), &mut frames)
        .unwrap();
    assert_eq!(r.frame.base().as_u64(), 0x1000);
    assert!(r.frame.frame_index() < FIRST_MANAGED_FRAME);

    let leaf = kernel.page_tables().entry(va).unwrap();
    assert!(leaf.pcd());
    assert!(leaf.pwt());
    assert!(leaf.writable());
    assert!(leaf.global());
    assert!(!leaf.user());
    assert_eq!(kernel.translate(va + 0x234), Some(PhysicalAddress::new(0x1234)));

    // Only the emptied page table goes back; the device page never came
    // from the allocator.
    let before = frames.outstanding();
    kernel.unmap(va, &mut frames, &mmu).unwrap();
    assert_eq!(frames.outstanding(), before - 1);
}

#[test]
fn repeated_faults_resolve_to_the_same_zeroed_frame() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);

    let base = kernel
        .map(Placement::Anywhere, 4, Permissions::RW, lazy(4), &mut frames)
        .unwrap();
    let access = FaultAccess::kernel(AccessKind::Read);
    let first = kernel
        .handle_page_fault(page(base, 2), access, &mut frames)
        .unwrap();
    let outstanding = frames.outstanding();
    let second = kernel
        .handle_page_fault(page(base, 2) + 0x800, access, &mut frames)
        .unwrap();

    assert!(first.newly_installed);
    assert!(!second.newly_installed);
    assert_eq!(first.frame, second.frame);
    assert_eq!(frames.outstanding(), outstanding);
    assert!(ram.mapper().frame_bytes(first.frame).iter().all(|&b| b == 0));

    let region = kernel.region_containing(page(base, 2)).unwrap();
    assert_eq!(
        region.object().physical_address(kernel.mapper(), 2),
        Some(first.frame.base())
    );
    assert_eq!(region.object().physical_address(kernel.mapper(), 1), None);
}

#[test]
fn mappings_never_overlap() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);
    let start = kernel_window().start;

    let a = kernel
        .map(Placement::Anywhere, 2, Permissions::RW, lazy(2), &mut frames)
        .unwrap();
    let b = kernel
        .map(Placement::Fixed(page(start, 5)), 3, Permissions::RW, lazy(3), &mut frames)
        .unwrap();
    assert_eq!((a, b), (start, page(start, 5)));

    let taken = kernel.map(Placement::Fixed(page(start, 6)), 1, Permissions::RW, lazy(1), &mut frames);
    assert_eq!(taken, Err(VmError::RangeUnavailable));

    // Three pages do not fit in the hole at 2..5, so the hint moves past `b`.
    let c = kernel
        .map(Placement::Hint(page(start, 1)), 4, Permissions::RW, lazy(4), &mut frames)
        .unwrap();
    assert_eq!(c, page(start, 8));
    let d = kernel
        .map(Placement::Hint(page(start, 1)), 3, Permissions::R, lazy(3), &mut frames)
        .unwrap();
    assert_eq!(d, page(start, 2));

    let ranges: Vec<_> = kernel.regions().map(|r| r.range()).collect();
    assert_eq!(ranges.len(), 4);
    for (i, x) in ranges.iter().enumerate() {
        for y in &ranges[i + 1..] {
            assert!(!x.overlaps(y), "{x:?} overlaps {y:?}");
        }
    }
    assert!(ranges.windows(2).all(|w| w[0].start < w[1].start));
}

#[test]
fn invalid_map_arguments_are_rejected() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);
    let before = frames.outstanding();

    let invalid = |r: Result<VirtualAddress, VmError>| matches!(r, Err(VmError::InvalidArgument(_)));

    assert!(invalid(kernel.map(Placement::Anywhere, 0, Permissions::RW, lazy(1), &mut frames)));
    assert!(invalid(kernel.map(Placement::Anywhere, 3, Permissions::RW, lazy(2), &mut frames)));
    assert!(invalid(kernel.map(
        Placement::Hint(kernel_window().start + 0x10),
        1,
        Permissions::RW,
        lazy(1),
        &mut frames
    )));
    assert!(invalid(kernel.map(
        Placement::Anywhere,
        1,
        Permissions::new().with_write(true),
        lazy(1),
        &mut frames
    )));
    assert!(invalid(kernel.map(Placement::Anywhere, 1, Permissions::USER_RW, lazy(1), &mut frames)));

    let outside = kernel.map(
        Placement::Fixed(user_window().start),
        1,
        Permissions::RW,
        lazy(1),
        &mut frames,
    );
    assert_eq!(outside, Err(VmError::RangeUnavailable));

    // Eager objects rejected up front never touched the allocator.
    let eager = VmObject::memory_backed(4, Commit::Eager).unwrap();
    assert!(invalid(kernel.map(Placement::Anywhere, 5, Permissions::RW, eager, &mut frames)));
    assert_eq!(frames.outstanding(), before);
    assert_eq!(kernel.regions().count(), 0);
}

#[test]
fn unknown_base_cannot_be_unmapped() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);
    let base = kernel
        .map(Placement::Anywhere, 2, Permissions::RW, lazy(2), &mut frames)
        .unwrap();

    assert!(matches!(
        kernel.unmap(page(base, 1), &mut frames, &mmu),
        Err(VmError::InvalidArgument(_))
    ));
    assert!(mmu.invalidations().is_empty());
    assert_eq!(kernel.regions().count(), 1);
}

#[test]
fn eager_map_rolls_back_when_frames_run_out() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);
    let before = frames.outstanding();

    // Page 0 needs its frame, the object table, a PD and a PT; page 1 its
    // frame; page 2 finds the allocator empty.
    frames.limit(5);
    let object = VmObject::memory_backed(8, Commit::Eager).unwrap();
    let r = kernel.map(Placement::Anywhere, 8, Permissions::RW, object, &mut frames);
    assert_eq!(r, Err(VmError::OutOfMemory));
    assert_eq!(kernel.regions().count(), 0);
    assert!(kernel.translate(kernel_window().start).is_none());
    // Only the page directory stays linked.
    assert_eq!(frames.outstanding(), before + 1);

    frames.unlimited();
    let object = VmObject::memory_backed(8, Commit::Eager).unwrap();
    let base = kernel
        .map(Placement::Anywhere, 8, Permissions::RW, object, &mut frames)
        .unwrap();
    for n in 0..8 {
        assert!(kernel.translate(page(base, n)).is_some());
    }
}

#[test]
fn kernel_mappings_made_later_are_visible_in_user_spaces() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let object = VmObject::memory_backed(1, Commit::Eager).unwrap();
    let va = kernel
        .map(Placement::Anywhere, 1, Permissions::RW, object, &mut frames)
        .unwrap();

    let pa = kernel.translate(va).unwrap();
    assert_eq!(user.translate(va), Some(pa));
    // The user space has no region there; only the shared tables map it.
    assert!(user.region_containing(va).is_none());

    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(kernel.translate(va), Some(pa));
}

#[test]
fn destroying_a_user_space_returns_every_frame() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let lazy_base = user
        .map(Placement::Anywhere, 600, Permissions::USER_RW, lazy(600), &mut frames)
        .unwrap();
    for n in [0, 511, 512, 599] {
        user.handle_page_fault(page(lazy_base, n), FaultAccess::user(AccessKind::Write), &mut frames)
            .unwrap();
    }
    let dma = user
        .map(
            Placement::Hint(VirtualAddress::new(0x4000_0000)),
            2,
            Permissions::USER_RW,
            VmObject::uncacheable(2, PageGranularity::Small).unwrap(),
            &mut frames,
        )
        .unwrap();
    let leaf = user.page_tables().entry(dma).unwrap();
    assert!(leaf.pcd() && !leaf.pwt());
    assert!(leaf.user() && !leaf.global());

    user.map(
        Placement::Anywhere,
        1,
        Permissions::USER_R,
        VmObject::mmio(PhysicalAddress::new(0x2000), 1).unwrap(),
        &mut frames,
    )
    .unwrap();
    assert!(frames.outstanding() > KERNEL_SPACE_FRAMES + 1);

    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(frames.outstanding(), KERNEL_SPACE_FRAMES);
    assert_eq!(
        user.destroy(&mut frames, &mmu),
        Err(VmError::InvalidArgument("address space already destroyed"))
    );
}

#[test]
fn access_outside_the_region_permissions_is_fatal() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let ro = user
        .map(Placement::Anywhere, 1, Permissions::USER_R, lazy(1), &mut frames)
        .unwrap();
    let write = user
        .handle_page_fault(ro, FaultAccess::user(AccessKind::Write), &mut frames)
        .unwrap_err();
    assert_eq!(write.reason, FaultReason::AccessViolation);

    let rw = user
        .map(Placement::Anywhere, 1, Permissions::USER_RW, lazy(1), &mut frames)
        .unwrap();
    let exec = user
        .handle_page_fault(rw, FaultAccess::user(AccessKind::Execute), &mut frames)
        .unwrap_err();
    assert_eq!(exec.reason, FaultReason::AccessViolation);
    user.handle_page_fault(rw, FaultAccess::user(AccessKind::Read), &mut frames)
        .unwrap();
    assert!(user.page_tables().entry(rw).unwrap().nx());

    let kva = kernel
        .map(Placement::Anywhere, 1, Permissions::RW, lazy(1), &mut frames)
        .unwrap();
    let from_user = kernel
        .handle_page_fault(kva, FaultAccess::user(AccessKind::Read), &mut frames)
        .unwrap_err();
    assert_eq!(from_user.reason, FaultReason::AccessViolation);

    let non_canonical = VirtualAddress::new(0x0000_8000_0000_0000);
    let fatal = kernel
        .handle_page_fault(non_canonical, FaultAccess::kernel(AccessKind::Read), &mut frames)
        .unwrap_err();
    assert_eq!(fatal.reason, FaultReason::NoRegion);

    user.destroy(&mut frames, &mmu).unwrap();
}

#[test]
fn switch_loads_the_root_and_active_spaces_survive() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    user.switch_to(&mmu);
    assert_eq!(mmu.loads(), [user.root()]);
    assert!(matches!(
        user.destroy(&mut frames, &mmu),
        Err(VmError::InvalidArgument(_))
    ));

    kernel.switch_to(&mmu);
    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(mmu.loads(), [user.root(), kernel.root()]);
}

#[test]
fn the_kernel_space_cannot_be_destroyed() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);
    assert!(kernel.destroy(&mut frames, &mmu).is_err());
    assert!(matches!(
        AddressSpace::<RamMapper>::new_user(&kernel, kernel_window(), &mut frames),
        Err(VmError::InvalidArgument(_))
    ));
}

#[test]
fn destroy_shoots_down_the_user_window_first() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let base = user
        .map(Placement::Anywhere, 2, Permissions::USER_RW, lazy(2), &mut frames)
        .unwrap();
    user.handle_page_fault(base, FaultAccess::user(AccessKind::Write), &mut frames)
        .unwrap();

    // Another CPU may still have run it; the calling one never did.
    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(
        mmu.invalidations(),
        [(ShootdownTarget::CpusUsing(user.root()), user_window())]
    );
    assert_eq!(frames.outstanding(), KERNEL_SPACE_FRAMES);
}

const LARGE: u64 = Size2M::SIZE;

fn large(pages: u64) -> VmObject {
    VmObject::memory_backed_large(pages, Commit::Lazy).unwrap()
}

#[test]
fn large_objects_are_mapped_with_2m_leaves() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);

    // Occupy the window start so the large region has to skip ahead.
    let small = kernel
        .map(Placement::Anywhere, 1, Permissions::RW, lazy(1), &mut frames)
        .unwrap();
    let base = kernel
        .map(Placement::Anywhere, 1024, Permissions::RW, large(1024), &mut frames)
        .unwrap();
    assert!(base.is_aligned::<Size2M>());
    assert!(base > small);
    let before = frames.outstanding();

    let access = FaultAccess::kernel(AccessKind::Write);
    let first = kernel
        .handle_page_fault(page(base, 3) + 5, access, &mut frames)
        .unwrap();
    assert!(first.newly_installed);
    // The 2 MiB frame, the object table and a page directory; no page table.
    assert_eq!(frames.outstanding(), before + 512 + 2);
    assert!(kernel.page_tables().entry(base).is_none());

    let pa = kernel.translate(base).unwrap();
    assert!(pa.is_aligned::<Size2M>());
    assert_eq!(first.frame.base(), pa + 3 * 4096);
    assert_eq!(kernel.translate(base + 0x1F_F123), Some(pa + 0x1F_F123));
    let whole = PhysicalPage::<Size4K>::containing_address(pa);
    assert!((0..512).all(|n| ram.mapper().frame_bytes(whole.add(n)).iter().all(|&b| b == 0)));

    // Anywhere else in the same large page is already mapped.
    let again = kernel
        .handle_page_fault(page(base, 511), access, &mut frames)
        .unwrap();
    assert!(!again.newly_installed);
    assert_eq!(again.frame, whole.add(511));
    assert_eq!(frames.outstanding(), before + 512 + 2);

    let second = kernel
        .handle_page_fault(base + LARGE, access, &mut frames)
        .unwrap();
    assert!(second.newly_installed);
    assert!(second.frame.base().is_aligned::<Size2M>());
    assert_ne!(second.frame.base(), pa);

    kernel.unmap(base, &mut frames, &mmu).unwrap();
    assert_eq!(
        mmu.invalidations(),
        [(ShootdownTarget::AllCpus, VirtualRange::from_pages(base, 1024).unwrap())]
    );
    assert!(kernel.translate(base).is_none());
    assert!(kernel.translate(base + LARGE).is_none());
    // Only the page directory is left.
    assert_eq!(frames.outstanding(), before + 1);
}

#[test]
fn uncacheable_large_pages_are_populated_when_mapped() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let kernel = kernel_space(&ram, &mut frames);
    let mut user: AddressSpace<_> = AddressSpace::new_user(&kernel, user_window(), &mut frames).unwrap();

    let object = VmObject::uncacheable(512, PageGranularity::Large).unwrap();
    let va = user
        .map(
            Placement::Hint(VirtualAddress::new(0x4000_1000)),
            512,
            Permissions::USER_RW,
            object,
            &mut frames,
        )
        .unwrap();
    assert_eq!(va, VirtualAddress::new(0x4020_0000));

    let pa = user.translate(va).unwrap();
    assert!(pa.is_aligned::<Size2M>());
    let region = user.region_containing(va).unwrap();
    assert_eq!(region.object().physical_address(user.mapper(), 7), Some(pa + 7 * 4096));

    let r = user
        .handle_page_fault(va + 0x8000, FaultAccess::user(AccessKind::Read), &mut frames)
        .unwrap();
    assert!(!r.newly_installed);

    user.destroy(&mut frames, &mmu).unwrap();
    assert_eq!(frames.outstanding(), KERNEL_SPACE_FRAMES);
}

#[test]
fn large_mappings_reject_partial_and_misaligned_requests() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);
    let start = kernel_window().start;

    assert!(VmObject::memory_backed_large(500, Commit::Lazy).is_err());
    assert!(VmObject::uncacheable(513, PageGranularity::Large).is_err());

    let invalid = |r: Result<VirtualAddress, VmError>| matches!(r, Err(VmError::InvalidArgument(_)));
    assert!(invalid(kernel.map(Placement::Anywhere, 256, Permissions::RW, large(512), &mut frames)));
    assert!(invalid(kernel.map(
        Placement::Fixed(page(start, 1)),
        512,
        Permissions::RW,
        large(512),
        &mut frames
    )));
    assert_eq!(kernel.regions().count(), 0);
}

/// Forwards 4 KiB frames only, like an allocator without large-frame support.
struct SmallFramesOnly<'a>(&'a mut TestFrames);

impl FrameAlloc for SmallFramesOnly<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.0.alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.0.free_4k(frame);
    }
}

#[test]
fn large_pages_without_large_frames_are_out_of_memory() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mut kernel = kernel_space(&ram, &mut frames);
    let before = frames.outstanding();

    let object = VmObject::memory_backed_large(512, Commit::Eager).unwrap();
    let mut small_only = SmallFramesOnly(&mut frames);
    let r = kernel.map(Placement::Anywhere, 512, Permissions::RW, object, &mut small_only);
    assert_eq!(r, Err(VmError::OutOfMemory));
    assert_eq!(kernel.regions().count(), 0);
    assert_eq!(frames.outstanding(), before);

    let base = kernel
        .map(Placement::Anywhere, 512, Permissions::RW, large(512), &mut frames)
        .unwrap();
    let fatal = kernel
        .handle_page_fault(base, FaultAccess::kernel(AccessKind::Read), &mut SmallFramesOnly(&mut frames))
        .unwrap_err();
    assert_eq!(fatal.reason, FaultReason::OutOfMemory);
}

#[test]
fn a_2m_slot_can_switch_between_small_and_large_pages() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut frames = TestFrames::new(&ram);
    let mmu = RecordingMmu::default();
    let mut kernel = kernel_space(&ram, &mut frames);
    let slot = VirtualAddress::new(kernel_window().start.as_u64().next_multiple_of(LARGE) + LARGE);
    let access = FaultAccess::kernel(AccessKind::Write);

    let small = kernel
        .map(Placement::Fixed(page(slot, 7)), 1, Permissions::RW, lazy(1), &mut frames)
        .unwrap();
    kernel.handle_page_fault(small, access, &mut frames).unwrap();
    kernel.unmap(small, &mut frames, &mmu).unwrap();

    let big = kernel
        .map(Placement::Fixed(slot), 512, Permissions::RW, large(512), &mut frames)
        .unwrap();
    assert!(kernel.handle_page_fault(page(big, 7), access, &mut frames).unwrap().newly_installed);
    kernel.unmap(big, &mut frames, &mmu).unwrap();

    let small = kernel
        .map(Placement::Fixed(page(slot, 9)), 1, Permissions::RW, lazy(1), &mut frames)
        .unwrap();
    assert!(kernel.handle_page_fault(small, access, &mut frames).unwrap().newly_installed);
    assert!(kernel.page_tables().entry(small).is_some());
}
