//! # Memory Layout

use kernel_memory_addresses::{VirtualAddress, VirtualRange};

/// Size of a base page / physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// Entries per page table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First PML4 slot of the kernel half. Slots `256..512` are shared by every
/// address space.
pub const KERNEL_PML4_START: usize = 256;

/// First canonical higher-half address.
pub const KERNEL_HALF_START: u64 = 0xffff_8000_0000_0000;

/// Lowest address handed out to user mappings; keeps null dereferences faulting.
pub const USER_SPACE_START: u64 = 0x0000_0000_0020_0000;

/// End (exclusive) of the canonical lower half.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Reserved virtual range of the kernel heap.
pub const KERNEL_HEAP_START: u64 = 0xffff_c000_0000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 1024 * 1024 * 1024;

/// Minimum amount the heap commits at once when it has to grow.
pub const KERNEL_HEAP_GROWTH: u64 = 2 * 1024 * 1024;

/// Window used for kernel `map` requests that are not the heap.
pub const KERNEL_VM_START: u64 = KERNEL_HEAP_START + KERNEL_HEAP_SIZE;
pub const KERNEL_VM_END: u64 = 0xffff_ff80_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Physical memory below this is never handed out (BIOS, real-mode IVT, VGA).
pub const LOW_MEMORY_END: u64 = 0x0010_0000;

#[must_use]
pub const fn user_window() -> VirtualRange {
    VirtualRange::new(
        VirtualAddress::new(USER_SPACE_START),
        VirtualAddress::new(USER_SPACE_END),
    )
}

#[must_use]
pub const fn kernel_window() -> VirtualRange {
    VirtualRange::new(
        VirtualAddress::new(KERNEL_VM_START),
        VirtualAddress::new(KERNEL_VM_END),
    )
}

#[must_use]
pub const fn kernel_heap_reserve() -> VirtualRange {
    VirtualRange::new(
        VirtualAddress::new(KERNEL_HEAP_START),
        VirtualAddress::new(KERNEL_HEAP_START + KERNEL_HEAP_SIZE),
    )
}

const _: () = {
    assert!(HHDM_BASE >= KERNEL_HALF_START);
    assert!(KERNEL_HEAP_START > HHDM_BASE);
    assert!(KERNEL_VM_START < KERNEL_VM_END);
    assert!(KERNEL_VM_END <= KERNEL_BASE);
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(KERNEL_HEAP_GROWTH));
    assert!(KERNEL_HEAP_GROWTH.is_multiple_of(PAGE_SIZE));
    assert!(USER_SPACE_START.is_multiple_of(PAGE_SIZE));
    assert!(((KERNEL_HALF_START >> 39) & 0x1FF) as usize == KERNEL_PML4_START);
};
