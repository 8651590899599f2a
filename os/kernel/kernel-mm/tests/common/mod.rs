#![allow(dead_code)]

use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualRange};
use kernel_mm::{BootMemory, HeapSource, KernelLayout};
use kernel_vmem::{Mmu, ShootdownTarget};
use std::alloc::{Layout, alloc_zeroed};
use std::sync::{Mutex, OnceLock};

/// Size of the host buffer that plays physical memory.
pub const RAM_BYTES: usize = 16 << 20;

/// Size of the pre-mapped heap arena.
pub const ARENA_BYTES: usize = 4 << 20;

pub const HEAP_GROWTH: u64 = 64 * 1024;

/// Physical layout handed to `init`: low memory, the kernel image at 1 MiB
/// and usable memory from 2 MiB to the end of the buffer.
pub const MEMORY_MAP: [MemoryMapEntry; 3] = [
    MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Usable),
    MemoryMapEntry::new(0x10_0000, 0x10_0000, MemoryKind::KernelImage),
    MemoryMapEntry::new(0x20_0000, RAM_BYTES as u64 - 0x20_0000, MemoryKind::Usable),
];

/// Everything a test needs to know about the booted singletons.
pub struct Machine {
    pub mmu: &'static RecordingMmu,
    pub hhdm_offset: u64,
    pub arena: VirtualRange,
}

fn leak_aligned(bytes: usize) -> *mut u8 {
    let layout = Layout::from_size_align(bytes, 4096).unwrap();
    let p = unsafe { alloc_zeroed(layout) };
    assert!(!p.is_null());
    p
}

/// Initialize memory management once per test binary.
pub fn boot() -> &'static Machine {
    static MACHINE: OnceLock<Machine> = OnceLock::new();
    MACHINE.get_or_init(|| {
        let ram = leak_aligned(RAM_BYTES);
        let arena = leak_aligned(ARENA_BYTES);
        let arena = VirtualRange::new(
            VirtualAddress::from_ptr(arena),
            VirtualAddress::from_ptr(arena) + ARENA_BYTES as u64,
        );
        let mmu: &'static RecordingMmu = Box::leak(Box::default());
        let layout = KernelLayout::new()
            .with_heap(HeapSource::Premapped(arena))
            .with_heap_growth(HEAP_GROWTH);
        let boot = BootMemory {
            map: &MEMORY_MAP,
            hhdm_offset: ram as u64,
        };
        unsafe { kernel_mm::init(boot, layout, mmu) }.unwrap();
        Machine {
            mmu,
            hhdm_offset: ram as u64,
            arena,
        }
    })
}

/// An [`Mmu`] that only records what it is asked to do.
#[derive(Default)]
pub struct RecordingMmu {
    active: Mutex<Option<PhysicalPage<Size4K>>>,
    loads: Mutex<Vec<PhysicalPage<Size4K>>>,
    invalidations: Mutex<Vec<(ShootdownTarget, VirtualRange)>>,
}

impl RecordingMmu {
    pub fn loads(&self) -> Vec<PhysicalPage<Size4K>> {
        self.loads.lock().unwrap().clone()
    }

    pub fn invalidations(&self) -> Vec<(ShootdownTarget, VirtualRange)> {
        self.invalidations.lock().unwrap().clone()
    }
}

impl Mmu for RecordingMmu {
    unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
        *self.active.lock().unwrap() = Some(root);
        self.loads.lock().unwrap().push(root);
    }

    fn active_root(&self) -> PhysicalPage<Size4K> {
        self.active
            .lock()
            .unwrap()
            .unwrap_or(PhysicalPage::from_frame_index(0))
    }

    fn invalidate(&self, target: ShootdownTarget, range: VirtualRange) {
        self.invalidations.lock().unwrap().push((target, range));
    }
}
