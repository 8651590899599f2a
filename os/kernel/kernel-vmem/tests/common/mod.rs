#![allow(dead_code)]

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualRange};
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper, ShootdownTarget};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Frames below this index are never handed out, so low physical
/// addresses stay free for MMIO tests.
pub const FIRST_MANAGED_FRAME: u64 = 16;

/// Byte written over every frame that goes back to [`TestFrames`].
pub const POISON: u8 = 0xCC;

/// A page-aligned host buffer standing in for physical memory `0..len`.
pub struct TestRam {
    base: *mut u8,
    layout: Layout,
}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * 4096, 4096).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn frames(&self) -> u64 {
        (self.layout.size() / 4096) as u64
    }

    pub fn mapper(&self) -> RamMapper {
        RamMapper {
            base: self.base as usize,
            len: self.layout.size() as u64,
        }
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Physical → host pointer for a [`TestRam`].
#[derive(Copy, Clone, Debug)]
pub struct RamMapper {
    base: usize,
    len: u64,
}

impl RamMapper {
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        unsafe { self.phys_to_ptr(pa).cast::<u64>().read() }
    }

    pub fn frame_bytes(&self, frame: PhysicalPage<Size4K>) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.phys_to_ptr(frame.base()), 4096) }
    }
}

impl PhysMapper for RamMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_u64() < self.len, "{pa:?} outside test RAM");
        (self.base + pa.as_u64() as usize) as *mut u8
    }
}

/// Frame allocator over a [`TestRam`] that tracks every outstanding frame
/// and panics on double frees.
pub struct TestFrames {
    mapper: RamMapper,
    free: Vec<PhysicalPage<Size4K>>,
    outstanding: BTreeSet<u64>,
    budget: Option<usize>,
}

impl TestFrames {
    pub fn new(ram: &TestRam) -> Self {
        let free = (FIRST_MANAGED_FRAME..ram.frames())
            .rev()
            .map(PhysicalPage::from_frame_index)
            .collect();
        let mapper = ram.mapper();
        let mut frames = Self {
            mapper,
            free,
            outstanding: BTreeSet::new(),
            budget: None,
        };
        // Dirty every frame so zero-fill is observable.
        for frame in frames.free.clone() {
            unsafe { std::ptr::write_bytes(frames.mapper.phys_to_ptr(frame.base()), POISON, 4096) };
        }
        frames.free.shrink_to_fit();
        frames
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.outstanding.contains(&frame.frame_index())
    }

    /// Allow only `n` more allocations to succeed.
    pub fn limit(&mut self, n: usize) {
        self.budget = Some(n);
    }

    pub fn unlimited(&mut self) {
        self.budget = None;
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if let Some(budget) = &mut self.budget {
            *budget = budget.checked_sub(1)?;
        }
        let frame = self.free.pop()?;
        assert!(self.outstanding.insert(frame.frame_index()));
        Some(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        assert!(
            self.outstanding.remove(&frame.frame_index()),
            "double or foreign free of {frame:?}"
        );
        unsafe { std::ptr::write_bytes(self.mapper.phys_to_ptr(frame.base()), POISON, 4096) };
        self.free.push(frame);
    }

    /// Lowest 2 MiB aligned run of free frames. Counts as one allocation
    /// against the budget; freed page by page through the default `free_2m`.
    fn alloc_2m(&mut self) -> Option<PhysicalPage<Size2M>> {
        if let Some(budget) = &mut self.budget {
            *budget = budget.checked_sub(1)?;
        }
        let free: BTreeSet<u64> = self.free.iter().map(|f| f.frame_index()).collect();
        let first = (0..)
            .map(|n| n * Size2M::FRAMES)
            .take_while(|&first| first + Size2M::FRAMES <= free.last().map_or(0, |l| l + 1))
            .find(|&first| (first..first + Size2M::FRAMES).all(|i| free.contains(&i)))?;
        self.free
            .retain(|f| !(first..first + Size2M::FRAMES).contains(&f.frame_index()));
        for i in first..first + Size2M::FRAMES {
            assert!(self.outstanding.insert(i));
        }
        Some(PhysicalPage::containing_address(
            PhysicalPage::<Size4K>::from_frame_index(first).base(),
        ))
    }
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
