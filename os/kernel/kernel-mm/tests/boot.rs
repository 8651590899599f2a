mod common;

use common::{HEAP_GROWTH, MEMORY_MAP, boot};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::{FrameError, HeapBacking, HeapError};
use kernel_info::memory::{KERNEL_HEAP_START, KERNEL_VM_START, USER_SPACE_START};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualRange};
use kernel_mm::{
    BootMemory, FaultOutcome, InitError, KernelAllocator, KernelHeapBacking, KernelLayout,
    PageFaultErrorCode, UserSpace,
};
use kernel_vmem::{Commit, FaultReason, Permissions, Placement, ShootdownTarget, VmError, VmObject};

const KERNEL_WRITE: PageFaultErrorCode = PageFaultErrorCode::new().with_write(true);
const USER_READ: PageFaultErrorCode = PageFaultErrorCode::new().with_user(true);
const USER_WRITE: PageFaultErrorCode = USER_READ.with_write(true);

#[test]
fn init_runs_once() {
    let machine = boot();
    assert!(kernel_mm::is_initialized());
    let again = BootMemory {
        map: &MEMORY_MAP,
        hhdm_offset: machine.hhdm_offset,
    };
    let err = unsafe { kernel_mm::init(again, KernelLayout::new(), machine.mmu) }.unwrap_err();
    assert_eq!(err, InitError::AlreadyInitialized);
}

#[test]
fn heap_serves_global_alloc() {
    let machine = boot();
    let before = kernel_mm::heap_stats().unwrap();
    assert_eq!(before.reserved, machine.arena.len());

    let layout = Layout::from_size_align(200, 64).unwrap();
    let p = unsafe { KernelAllocator.alloc_zeroed(layout) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 64, 0);
    assert!(machine.arena.contains(VirtualAddress::from_ptr(p)));
    assert!(unsafe { std::slice::from_raw_parts(p, 200) }.iter().all(|&b| b == 0));
    unsafe { p.write_bytes(0xAB, 200) };

    let q = kernel_mm::allocate(5000, 16).unwrap();
    let stats = kernel_mm::heap_stats().unwrap();
    assert!(stats.committed >= HEAP_GROWTH);
    assert!(stats.allocations >= 2);

    unsafe { KernelAllocator.dealloc(p, layout) };
    unsafe { kernel_mm::free(q.as_ptr()) }.unwrap();
    assert_eq!(unsafe { kernel_mm::free(q.as_ptr()) }, Err(HeapError::InvalidFree));

    // Freed memory is reused: the high-water mark stays put.
    let committed = kernel_mm::heap_stats().unwrap().committed;
    let r = kernel_mm::allocate(4000, 16).unwrap();
    assert_eq!(kernel_mm::heap_stats().unwrap().committed, committed);
    unsafe { kernel_mm::free(r.as_ptr()) }.unwrap();

    assert_eq!(kernel_mm::allocate(0, 16), Err(HeapError::InvalidArgument));
}

#[test]
fn frames_round_trip() {
    boot();
    let a = kernel_mm::allocate_frame().unwrap();
    let b = kernel_mm::allocate_frame().unwrap();
    assert_ne!(a, b);
    kernel_mm::free_frame(a).unwrap();
    kernel_mm::free_frame(b).unwrap();

    let run = kernel_mm::allocate_contiguous(8).unwrap();
    assert!(run.frame_index() > 0x200, "the bitmap frame is reserved");
    kernel_mm::free_contiguous(run, 8).unwrap();

    // Other tests allocate concurrently; double frees are only checked
    // under one lock hold.
    {
        let mut frames = kernel_mm::frames().unwrap().lock_irq();
        let c = frames.allocate().unwrap();
        frames.free(c).unwrap();
        assert_eq!(frames.free(c), Err(FrameError::NotAllocated));
    }

    // Below 1 MiB and past the end of the map nothing is handed out.
    assert_eq!(
        kernel_mm::free_frame(PhysicalPage::from_frame_index(0x10)),
        Err(FrameError::NotAllocated)
    );
    assert_eq!(
        kernel_mm::free_frame(PhysicalPage::from_frame_index(1 << 20)),
        Err(FrameError::Unmanaged)
    );
    assert!(kernel_mm::frame_stats().unwrap().free > 0);
}

#[test]
fn kernel_mappings_fault_in_lazily() {
    boot();
    let object = VmObject::memory_backed(4, Commit::Lazy).unwrap();
    let base = kernel_mm::map_kernel(Placement::Anywhere, 4, Permissions::RW, object).unwrap();
    assert!(base.as_u64() >= KERNEL_VM_START);
    assert_eq!(kernel_mm::translate_kernel(base), None);

    let va = base.as_u64() + 0x1234;
    let FaultOutcome::Resolved(first) = kernel_mm::handle_page_fault(va, KERNEL_WRITE, None) else {
        panic!("fault was not resolved");
    };
    assert!(first.newly_installed);
    let FaultOutcome::Resolved(again) = kernel_mm::handle_page_fault(va, KERNEL_WRITE, None) else {
        panic!("fault was not resolved");
    };
    assert_eq!(again.frame, first.frame);
    assert!(!again.newly_installed);
    assert_eq!(
        kernel_mm::translate_kernel(VirtualAddress::new(va)).map(|pa| pa.as_u64()),
        Some(first.frame.base().as_u64() + 0x234)
    );

    kernel_mm::unmap_kernel(base).unwrap();
    assert_eq!(kernel_mm::translate_kernel(VirtualAddress::new(va)), None);
    let range = VirtualRange::from_pages(base, 4).unwrap();
    assert!(boot().mmu.invalidations().contains(&(ShootdownTarget::AllCpus, range)));
    assert!(matches!(
        kernel_mm::unmap_kernel(base),
        Err(VmError::InvalidArgument(_))
    ));
}

#[test]
fn kernel_mappings_can_use_2m_pages() {
    boot();
    let object = VmObject::memory_backed_large(512, Commit::Eager).unwrap();
    let base = kernel_mm::map_kernel(Placement::Anywhere, 512, Permissions::RW, object).unwrap();
    assert_eq!(base.as_u64() % 0x20_0000, 0);

    let pa = kernel_mm::translate_kernel(base).unwrap().as_u64();
    assert_eq!(pa % 0x20_0000, 0);
    assert_eq!(
        kernel_mm::translate_kernel(base + 0x1F_F008).map(|pa| pa.as_u64()),
        Some(pa + 0x1F_F008)
    );

    kernel_mm::unmap_kernel(base).unwrap();
    assert_eq!(kernel_mm::translate_kernel(base), None);
    let range = VirtualRange::from_pages(base, 512).unwrap();
    assert!(boot().mmu.invalidations().contains(&(ShootdownTarget::AllCpus, range)));
}

#[test]
fn heap_backing_maps_eagerly_into_the_kernel_space() {
    boot();
    let reserve = VirtualRange::from_pages(VirtualAddress::new(KERNEL_HEAP_START), 16).unwrap();
    let mut backing = KernelHeapBacking::new(
        kernel_mm::kernel_space().unwrap(),
        kernel_mm::frames().unwrap(),
        reserve,
    );
    assert_eq!(backing.reserved(), reserve);

    backing.commit(reserve.start, 3 * 4096).unwrap();
    for page in 0..3 {
        assert!(kernel_mm::translate_kernel(reserve.start + page * 4096).is_some());
    }
    assert_eq!(kernel_mm::translate_kernel(reserve.start + 3 * 4096), None);
    assert_eq!(backing.commit(reserve.start, 4096), Err(HeapError::OutOfMemory));
}

#[test]
fn heap_backing_outgrows_the_default_region_capacity() {
    boot();
    let pages = kernel_vmem::region::MAX_REGIONS as u64 + 8;
    let start = VirtualAddress::new(KERNEL_HEAP_START + 0x1000_0000);
    let reserve = VirtualRange::from_pages(start, pages).unwrap();
    let mut backing = KernelHeapBacking::new(
        kernel_mm::kernel_space().unwrap(),
        kernel_mm::frames().unwrap(),
        reserve,
    );

    // One region per single-page growth step.
    for page in 0..pages {
        backing.commit(start + page * 4096, 4096).unwrap();
    }
    assert!(kernel_mm::translate_kernel(start + (pages - 1) * 4096).is_some());
    assert!(kernel_mm::kernel_space().unwrap().lock_irq().regions().count() as u64 > pages);
}

#[test]
fn user_spaces_are_isolated_and_torn_down() {
    let machine = boot();
    let space = UserSpace::new().unwrap();

    let eager = VmObject::memory_backed(2, Commit::Eager).unwrap();
    let ro = space.map(Placement::Anywhere, 2, Permissions::R, eager).unwrap();
    assert_eq!(ro.as_u64(), USER_SPACE_START);
    assert!(space.translate(ro + 4096).is_some());
    // Kernel mappings never see user regions.
    assert_eq!(kernel_mm::translate_kernel(ro), None);

    let lazy = VmObject::memory_backed(1, Commit::Lazy).unwrap();
    let rw = space.map(Placement::Anywhere, 1, Permissions::RW, lazy).unwrap();
    assert!(matches!(
        kernel_mm::handle_page_fault(rw.as_u64(), USER_WRITE, Some(&space)),
        FaultOutcome::Resolved(r) if r.newly_installed
    ));

    let FaultOutcome::Terminate(fatal) = kernel_mm::handle_page_fault(ro.as_u64(), USER_WRITE, Some(&space))
    else {
        panic!("write to a read-only region was resolved");
    };
    assert_eq!(fatal.reason, FaultReason::AccessViolation);

    let FaultOutcome::Terminate(fatal) = kernel_mm::handle_page_fault(0x7000_0000, USER_READ, Some(&space))
    else {
        panic!("fault outside every region was resolved");
    };
    assert_eq!(fatal.reason, FaultReason::NoRegion);

    // User code cannot reach kernel memory.
    assert!(matches!(
        kernel_mm::handle_page_fault(KERNEL_VM_START, USER_READ, Some(&space)),
        FaultOutcome::Terminate(_)
    ));

    space.switch_to();
    assert_eq!(machine.mmu.loads().last(), Some(&space.root()));
    kernel_mm::switch_to_kernel();

    space.unmap(rw).unwrap();
    assert_eq!(space.translate(rw), None);
    drop(space);
}
